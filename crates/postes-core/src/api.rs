//! HTTP client for the postes REST API.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::models::{City, Neighborhood, Record, RemotePoste};
use crate::remote::{PhotoUpload, RemoteClient, SubmitOutcome};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authorized")]
    Unauthorized,
    #[error("server answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Access/refresh pair returned by `POST /token/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: Option<i64>,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_header(token: &str) -> String {
        format!("Token {token}")
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }

    /// Exchange credentials for a token pair.
    pub async fn obtain_token(&self, username: &str, password: &str) -> Result<TokenPair, ApiError> {
        let response = self
            .client
            .post(self.url("token/"))
            .json(&TokenRequest { username, password })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh_token(&self, refresh: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.url("token/refresh/"))
            .json(&RefreshRequest { refresh })
            .send()
            .await?;
        let body: RefreshResponse = Self::check(response).await?.json().await?;
        Ok(body.access)
    }

    pub async fn cities(&self, token: &str) -> Result<Vec<City>, ApiError> {
        let response = self
            .client
            .get(self.url("cidades/"))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(token))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn neighborhoods(&self, city_id: i64, token: &str) -> Result<Vec<Neighborhood>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("cidades/{city_id}/bairros/")))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(token))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_postes(&self, token: &str) -> Result<Vec<RemotePoste>, ApiError> {
        let response = self
            .client
            .get(self.url("postes/"))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(token))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn delete_poste(&self, id: i64, token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.url(&format!("postes/{id}/")))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(token))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn build_form(record: &Record, photo: Option<PhotoUpload>) -> Result<Form, reqwest::Error> {
        let mut form = Form::new()
            .text("cidade", record.city.clone())
            .text("bairro", record.neighborhood.clone())
            .text("zonautm", record.utm_zone.to_string())
            .text("localizacao_utm_x", record.utm_easting.to_string())
            .text("localizacao_utm_y", record.utm_northing.to_string())
            .text("observacoes", record.notes.clone().unwrap_or_default());

        if let Some(photo) = photo {
            let part = Part::bytes(photo.bytes)
                .file_name(photo.file_name)
                .mime_str(&photo.mime)?;
            form = form.part("foto", part);
        }
        Ok(form)
    }
}

/// Map a submission response status onto the outcome taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> SubmitOutcome {
    match status.as_u16() {
        200 | 201 => {
            let remote_id = serde_json::from_str::<CreatedResponse>(body)
                .ok()
                .and_then(|created| created.id);
            SubmitOutcome::Created { remote_id }
        }
        401 | 403 => SubmitOutcome::Unauthorized,
        408 | 425 | 429 => SubmitOutcome::TransientFailure(format!("{status}")),
        500..=599 => SubmitOutcome::TransientFailure(format!("{status}: {body}")),
        _ => {
            let reason = if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            };
            SubmitOutcome::Rejected(reason)
        }
    }
}

#[async_trait]
impl RemoteClient for ApiClient {
    async fn submit(&self, record: &Record, photo: Option<PhotoUpload>, token: &str) -> SubmitOutcome {
        let form = match Self::build_form(record, photo) {
            Ok(form) => form,
            Err(e) => return SubmitOutcome::Rejected(format!("invalid photo attachment: {e}")),
        };

        let response = self
            .client
            .post(self.url("postes/"))
            .header(reqwest::header::AUTHORIZATION, Self::auth_header(token))
            .multipart(form)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(local_id = record.id, error = %e, "submission did not reach the server");
                return SubmitOutcome::TransientFailure(e.to_string());
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            // Status is known, only the body was lost.
            Err(e) if status.is_success() => {
                debug!(local_id = record.id, error = %e, "could not read creation response body");
                String::new()
            }
            Err(e) => return SubmitOutcome::TransientFailure(e.to_string()),
        };

        let outcome = classify_status(status, &body);
        debug!(local_id = record.id, %status, %outcome, "submission answered");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRecord;
    use crate::utm::UtmCoordinate;
    use mockito::Matcher;

    fn record() -> Record {
        let utm = UtmCoordinate { zone: 23, band: 'K', easting: 683000.5, northing: 7465000.25 };
        let mut record = Record::unsaved(NewRecord::new("7", "42", utm).with_notes("torto"));
        record.id = 5;
        record
    }

    fn client_for(server: &mockito::ServerGuard) -> ApiClient {
        ApiClient::with_client(Client::new(), &format!("{}/api/", server.url()))
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::CREATED, r#"{"id": 31}"#),
            SubmitOutcome::Created { remote_id: Some(31) }
        );
        assert_eq!(
            classify_status(StatusCode::CREATED, "not json"),
            SubmitOutcome::Created { remote_id: None }
        );
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, ""), SubmitOutcome::Unauthorized);
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            SubmitOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SubmitOutcome::TransientFailure(_)
        ));
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "{\"cidade\": [\"invalid\"]}\n"),
            SubmitOutcome::Rejected("{\"cidade\": [\"invalid\"]}".to_string())
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, ""),
            SubmitOutcome::Rejected("404 Not Found".to_string())
        );
    }

    #[tokio::test]
    async fn submit_sends_multipart_fields_with_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/postes/")
            .match_header("authorization", "Token abc")
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("name=\"cidade\"\r\n\r\n7".into()),
                Matcher::Regex("name=\"bairro\"\r\n\r\n42".into()),
                Matcher::Regex("name=\"zonautm\"\r\n\r\n23".into()),
                Matcher::Regex("name=\"observacoes\"\r\n\r\ntorto".into()),
                Matcher::Regex("name=\"foto\"; filename=\"p.jpg\"".into()),
            ]))
            .with_status(201)
            .with_body(r#"{"id": 99}"#)
            .create_async()
            .await;

        let photo = PhotoUpload {
            file_name: "p.jpg".into(),
            mime: "image/jpeg".into(),
            bytes: vec![0xff, 0xd8, 0xff],
        };
        let outcome = client_for(&server).submit(&record(), Some(photo), "abc").await;

        assert_eq!(outcome, SubmitOutcome::Created { remote_id: Some(99) });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn submit_maps_expired_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/postes/")
            .with_status(401)
            .create_async()
            .await;

        let outcome = client_for(&server).submit(&record(), None, "old").await;
        assert_eq!(outcome, SubmitOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let client = ApiClient::with_client(Client::new(), "http://127.0.0.1:9/api");
        let outcome = client.submit(&record(), None, "abc").await;
        assert!(matches!(outcome, SubmitOutcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn token_endpoints() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/token/")
            .match_body(Matcher::Json(serde_json::json!({"username": "ana", "password": "pw"})))
            .with_status(200)
            .with_body(r#"{"access": "a1", "refresh": "r1"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api/token/refresh/")
            .match_body(Matcher::Json(serde_json::json!({"refresh": "r1"})))
            .with_status(200)
            .with_body(r#"{"access": "a2"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let pair = client.obtain_token("ana", "pw").await.unwrap();
        assert_eq!(pair, TokenPair { access: "a1".into(), refresh: "r1".into() });
        assert_eq!(client.refresh_token("r1").await.unwrap(), "a2");
    }

    #[tokio::test]
    async fn catalog_and_listing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/cidades/")
            .match_header("authorization", "Token t")
            .with_body(r#"[{"id": 1, "nome": "Rio"}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/cidades/1/bairros/")
            .with_body(r#"[{"id": 4, "nome": "Centro"}]"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/api/postes/8/")
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("GET", "/api/postes/")
            .with_status(401)
            .create_async()
            .await;

        let client = client_for(&server);
        assert_eq!(client.cities("t").await.unwrap()[0].name, "Rio");
        assert_eq!(client.neighborhoods(1, "t").await.unwrap()[0].id, 4);
        client.delete_poste(8, "t").await.unwrap();
        assert!(matches!(client.list_postes("t").await, Err(ApiError::Unauthorized)));
    }
}
