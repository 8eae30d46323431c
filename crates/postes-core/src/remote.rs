//! Remote Submission Client contract.

use async_trait::async_trait;
use std::fmt;

use crate::models::Record;

/// Result of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted. Carries the server id when the response body has one.
    Created { remote_id: Option<i64> },
    /// Token missing, invalid or expired.
    Unauthorized,
    /// Validation failure; retrying the same payload will not help.
    Rejected(String),
    /// Network, timeout or server-side failure; safe to retry later.
    TransientFailure(String),
}

impl SubmitOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, SubmitOutcome::Created { .. })
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Created { remote_id: Some(id) } => write!(f, "created (remote id {id})"),
            SubmitOutcome::Created { remote_id: None } => write!(f, "created"),
            SubmitOutcome::Unauthorized => write!(f, "unauthorized"),
            SubmitOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            SubmitOutcome::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
        }
    }
}

/// Photo bytes ready to attach as the `foto` multipart field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Uploads one record. Implementations never touch local storage.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn submit(
        &self,
        record: &Record,
        photo: Option<PhotoUpload>,
        token: &str,
    ) -> SubmitOutcome;
}
