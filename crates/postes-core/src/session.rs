//! Session/Token Manager.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError};
use crate::config::{ConfigError, State};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no refresh token stored; log in again")]
    NoRefreshToken,
    #[error("credentials rejected by the server")]
    Rejected,
    #[error(transparent)]
    Api(ApiError),
    #[error(transparent)]
    State(#[from] ConfigError),
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => AuthError::Rejected,
            other => AuthError::Api(other),
        }
    }
}

/// Source of bearer tokens for authenticated calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Currently stored access token, if any.
    async fn access_token(&self) -> Option<String>;

    /// Obtain a new access token from the refresh token. Exactly one
    /// network call; callers decide whether to retry.
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// Tokens persisted in the session state file.
pub struct SessionManager {
    api: Arc<ApiClient>,
    path: PathBuf,
    state: Mutex<State>,
}

impl SessionManager {
    pub fn load(api: Arc<ApiClient>, path: PathBuf) -> Result<Self, AuthError> {
        let state = State::load_from(&path)?;
        Ok(Self {
            api,
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let pair = self.api.obtain_token(username, password).await?;
        let mut state = self.state.lock().await;
        state.store_tokens(Some(username.to_string()), pair.access, pair.refresh);
        state.save_to(&self.path)?;
        info!(username, "logged in");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        let mut state = self.state.lock().await;
        state.clear_tokens();
        state.save_to(&self.path)?;
        Ok(())
    }

    pub async fn username(&self) -> Option<String> {
        self.state.lock().await.auth.username.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.lock().await.is_logged_in()
    }
}

#[async_trait]
impl TokenSource for SessionManager {
    async fn access_token(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .auth
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        // Held across the request so concurrent callers do not refresh twice.
        let mut state = self.state.lock().await;
        let refresh = state
            .auth
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;

        let access = match self.api.refresh_token(&refresh).await {
            Ok(access) => access,
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                return Err(e.into());
            }
        };

        state.store_access_token(access.clone());
        state.save_to(&self.path)?;
        info!("access token refreshed");
        Ok(access)
    }
}
