//! Client for the hosted hippocampus agent API.
//!
//! Provides the `AgentApi` trait (what the controllers depend on) and
//! `ApiClient`, its reqwest implementation:
//! - `GET  /users/{phone}`           : look up a user by phone number
//! - `POST /users`                   : create a user
//! - `POST /agent/hippocampus/run`   : start or continue an agent session
//!
//! Every request carries the static `x-api-key` header. Failed calls are
//! surfaced once; nothing here retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ApiConfig, DEFAULT_SESSION_ORIGIN};
use crate::models::{Blob, RemoteId};

const RUN_PATH: [&str; 3] = ["agent", "hippocampus", "run"];

/// `message_type` sent with every run. Audio travels in `media_contents`.
pub const TEXT_MESSAGE_TYPE: &str = "text";

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing API key")]
    MissingApiKey,

    #[error("API key contains characters not allowed in a header")]
    InvalidApiKey,

    #[error("Invalid base URL {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },

    #[error("Record not found")]
    NotFound,

    #[error("HTTP error! status: {status}")]
    Status { status: u16, body: String },

    #[error("Service unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Agent reply carried no message")]
    EmptyReply,

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl ApiError {
    /// HTTP status for errors that came back from the server.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::NotFound => Some(404),
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

/// User record returned by the lookup endpoint. Unknown fields are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: RemoteId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub phone_number: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    phone_number: &'a str,
    user_data: UserData<'a>,
}

#[derive(Debug, Serialize)]
struct UserData<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedUser {
    pub id: RemoteId,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One inline attachment of a run request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaContent {
    pub mime_type: String,
    /// `data:<mime>;base64,<payload>`
    pub data: String,
}

impl From<&Blob> for MediaContent {
    fn from(blob: &Blob) -> Self {
        Self {
            mime_type: blob.mime_type.clone(),
            data: blob.to_data_url(),
        }
    }
}

/// First message of a new agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRun {
    pub content: String,
    pub message_type: String,
    pub session_origin: String,
    pub media: Option<Vec<MediaContent>>,
}

impl StartRun {
    pub fn text(content: impl Into<String>, session_origin: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: TEXT_MESSAGE_TYPE.to_string(),
            session_origin: session_origin.into(),
            media: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    message_content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_name: Option<&'a str>,
    message_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_origin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_contents: Option<&'a [MediaContent]>,
    user_id: &'a RemoteId,
}

/// Reply of a run. `session_id` is only present when a session was started.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RunReply {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_id: Option<RemoteId>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// AgentApi trait
// ============================================================================

/// The remote operations the chat client depends on.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn lookup_user(&self, phone: &str) -> Result<UserRecord, ApiError>;

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, ApiError>;

    async fn start_run(&self, run: &StartRun, user_id: &RemoteId) -> Result<RunReply, ApiError>;

    async fn continue_run(
        &self,
        session_id: &str,
        content: &str,
        user_id: &RemoteId,
        media: Option<&[MediaContent]>,
    ) -> Result<RunReply, ApiError>;

    /// `session_origin` used when this client starts a session.
    fn session_origin(&self) -> &str {
        DEFAULT_SESSION_ORIGIN
    }

    /// Attach `blob` as a data URL and run it through the session, starting
    /// one when `session_id` is `None`.
    async fn send_audio(
        &self,
        session_id: Option<&str>,
        content: &str,
        blob: &Blob,
        user_id: &RemoteId,
    ) -> Result<RunReply, ApiError> {
        let media = vec![MediaContent::from(blob)];
        tracing::debug!(
            mime_type = %blob.mime_type,
            bytes = blob.len(),
            has_session = session_id.is_some(),
            "Sending audio message"
        );
        match session_id {
            Some(session_id) => {
                self.continue_run(session_id, content, user_id, Some(media.as_slice()))
                    .await
            }
            None => {
                let run = StartRun {
                    media: Some(media),
                    ..StartRun::text(content, self.session_origin())
                };
                self.start_run(&run, user_id).await
            }
        }
    }
}

// ============================================================================
// ApiClient
// ============================================================================

/// reqwest-backed `AgentApi`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    session_origin: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        if config.api_key.trim().is_empty() {
            return Err(ApiError::MissingApiKey);
        }

        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            ApiError::InvalidBaseUrl {
                url: config.base_url.clone(),
                message: e.to_string(),
            }
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl {
                url: config.base_url.clone(),
                message: "not a hierarchical URL".to_string(),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let mut key =
            HeaderValue::from_str(config.api_key.trim()).map_err(|_| ApiError::InvalidApiKey)?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);

        let mut builder = Client::builder().default_headers(headers);
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
            session_origin: config.session_origin.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!(error = %e, "API request failed");
            if e.is_builder() {
                ApiError::Client(e)
            } else {
                ApiError::Unavailable(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "API returned an error status");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(ApiError::Unavailable)?;
        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!(error = %e, "Failed to decode API response");
            ApiError::Decode(e.to_string())
        })
    }

    async fn run(&self, request: &RunRequest<'_>) -> Result<RunReply, ApiError> {
        let url = self.endpoint(RUN_PATH);
        tracing::debug!(
            url = %url,
            continuing = request.session_name.is_some(),
            media = request.media_contents.map_or(0, |m| m.len()),
            "Running hippocampus agent"
        );
        self.send_json(self.client.post(url).json(request)).await
    }
}

fn has_user_id(body: &serde_json::Value) -> bool {
    use serde_json::Value;
    match body.get("id") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(id)) => !id.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

#[async_trait]
impl AgentApi for ApiClient {
    async fn lookup_user(&self, phone: &str) -> Result<UserRecord, ApiError> {
        let url = self.endpoint(["users", phone]);
        tracing::debug!(url = %url, "Looking up user");
        let body: Option<serde_json::Value> = match self.send_json(self.client.get(url)).await {
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Err(ApiError::NotFound)
            }
            other => other?,
        };
        // a 2xx with no usable id is a miss, not a broken server
        let Some(body) = body.filter(has_user_id) else {
            tracing::debug!("Lookup answered without a user id");
            return Err(ApiError::NotFound);
        };
        serde_json::from_value(body).map_err(|e| {
            tracing::warn!(error = %e, "Failed to decode user record");
            ApiError::Decode(e.to_string())
        })
    }

    async fn create_user(&self, user: &NewUser) -> Result<CreatedUser, ApiError> {
        let url = self.endpoint(["users"]);
        tracing::debug!(url = %url, "Creating user");
        let body = CreateUserRequest {
            phone_number: &user.phone_number,
            user_data: UserData { name: &user.name },
        };
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn start_run(&self, run: &StartRun, user_id: &RemoteId) -> Result<RunReply, ApiError> {
        self.run(&RunRequest {
            message_content: &run.content,
            session_name: None,
            message_type: &run.message_type,
            session_origin: Some(&run.session_origin),
            media_contents: run.media.as_deref().filter(|m| !m.is_empty()),
            user_id,
        })
        .await
    }

    async fn continue_run(
        &self,
        session_id: &str,
        content: &str,
        user_id: &RemoteId,
        media: Option<&[MediaContent]>,
    ) -> Result<RunReply, ApiError> {
        self.run(&RunRequest {
            message_content: content,
            session_name: Some(session_id),
            message_type: TEXT_MESSAGE_TYPE,
            session_origin: None,
            media_contents: media.filter(|m| !m.is_empty()),
            user_id,
        })
        .await
    }

    fn session_origin(&self) -> &str {
        &self.session_origin
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> ApiConfig {
        ApiConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            session_origin: "web".to_string(),
            request_timeout_secs: Some(5),
        }
    }

    async fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&test_config(&format!("{}/api/v1", server.uri()))).unwrap()
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let mut config = test_config("http://localhost");
        config.api_key = "  ".to_string();
        assert!(matches!(ApiClient::new(&config), Err(ApiError::MissingApiKey)));
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = test_config("not a url");
        assert!(matches!(
            ApiClient::new(&config),
            Err(ApiError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_endpoint_joins_under_base_path() {
        let client = ApiClient::new(&test_config("https://example.com/api/v1/")).unwrap();
        assert_eq!(
            client.endpoint(RUN_PATH).as_str(),
            "https://example.com/api/v1/agent/hippocampus/run"
        );
        assert_eq!(
            client.endpoint(["users", "119"]).as_str(),
            "https://example.com/api/v1/users/119"
        );
    }

    #[tokio::test]
    async fn test_lookup_user_sends_api_key_and_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/11999998888"))
            .and(header("x-api-key", "test-key"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 12,
                "name": "Ana",
                "created_at": "2025-01-01T10:00:00",
                "email": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = client_for(&server)
            .await
            .lookup_user("11999998888")
            .await
            .unwrap();
        assert_eq!(user.id, RemoteId::Int(12));
        assert_eq!(user.name.as_deref(), Some("Ana"));
        assert_eq!(user.created_at.as_deref(), Some("2025-01-01T10:00:00"));
        assert!(user.extra.contains_key("email"));
    }

    #[tokio::test]
    async fn test_lookup_user_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .lookup_user("11999998888")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_lookup_without_user_id_is_not_found() {
        for body in [
            serde_json::json!(null),
            serde_json::json!({ "name": "Ana" }),
            serde_json::json!({ "id": null, "name": "Ana" }),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
                .expect(1)
                .mount(&server)
                .await;

            let err = client_for(&server)
                .await
                .lookup_user("11999998888")
                .await
                .unwrap_err();
            assert!(err.is_not_found(), "{body} gave {err:?}");
        }
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .create_user(&NewUser {
                phone_number: "11999998888".into(),
                name: "Ana".into(),
            })
            .await
            .unwrap_err();
        match err {
            ApiError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("Expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_user_body_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/users"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "phone_number": "11999998888",
                "user_data": { "name": "Ana" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "u-1",
                "phone_number": "11999998888"
            })))
            .mount(&server)
            .await;

        let created = client_for(&server)
            .await
            .create_user(&NewUser {
                phone_number: "11999998888".into(),
                name: "Ana".into(),
            })
            .await
            .unwrap();
        assert_eq!(created.id, RemoteId::Text("u-1".into()));
    }

    #[tokio::test]
    async fn test_start_run_body_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/hippocampus/run"))
            .and(body_json(serde_json::json!({
                "message_content": "Olá",
                "message_type": "text",
                "session_origin": "web",
                "user_id": 12
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Oi!",
                "message_id": 99,
                "session_id": "s1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client_for(&server)
            .await
            .start_run(&StartRun::text("Olá", "web"), &RemoteId::Int(12))
            .await
            .unwrap();
        assert_eq!(reply.message.as_deref(), Some("Oi!"));
        assert_eq!(reply.message_id, Some(RemoteId::Int(99)));
        assert_eq!(reply.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_continue_run_body_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/hippocampus/run"))
            .and(body_json(serde_json::json!({
                "message_content": "de novo",
                "session_name": "s1",
                "message_type": "text",
                "user_id": 12
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "ok",
                "message_id": "m2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client_for(&server)
            .await
            .continue_run("s1", "de novo", &RemoteId::Int(12), None)
            .await
            .unwrap();
        assert_eq!(reply.message.as_deref(), Some("ok"));
        assert!(reply.session_id.is_none());
    }

    #[tokio::test]
    async fn test_send_audio_continues_with_media() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/hippocampus/run"))
            .and(body_json(serde_json::json!({
                "message_content": "ouça",
                "session_name": "s1",
                "message_type": "text",
                "media_contents": [{
                    "mime_type": "audio/webm",
                    "data": "data:audio/webm;base64,AQID"
                }],
                "user_id": "u-1"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "message": "ouvi" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let blob = Blob::new("audio/webm", vec![1, 2, 3]);
        let reply = client_for(&server)
            .await
            .send_audio(Some("s1"), "ouça", &blob, &RemoteId::from("u-1"))
            .await
            .unwrap();
        assert_eq!(reply.message.as_deref(), Some("ouvi"));
    }

    #[tokio::test]
    async fn test_send_audio_without_session_starts_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/hippocampus/run"))
            .and(body_json(serde_json::json!({
                "message_content": "",
                "message_type": "text",
                "session_origin": "web",
                "media_contents": [{
                    "mime_type": "audio/wav",
                    "data": "data:audio/wav;base64,AA=="
                }],
                "user_id": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "oi",
                "session_id": "s9"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let blob = Blob::new("audio/wav", vec![0]);
        let reply = client_for(&server)
            .await
            .send_audio(None, "", &blob, &RemoteId::Int(3))
            .await
            .unwrap();
        assert_eq!(reply.session_id.as_deref(), Some("s9"));
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .lookup_user("1")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // bind then drop so nothing listens on the port
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = ApiClient::new(&test_config(&format!("http://{addr}/api/v1"))).unwrap();
        let err = client.lookup_user("1").await.unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)), "got {err:?}");
        assert_eq!(err.status(), None);
    }
}
