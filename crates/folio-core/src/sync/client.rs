//! HTTP client for the sync server
//!
//! Every authenticated request carries the bearer token plus the
//! `X-API-Key`/`X-App-Id` headers. A 401 triggers exactly one token refresh
//! followed by exactly one retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::message::{
    ApiErrorBody, AuthResponse, DeltaRequest, DeltaResponse, LoginRequest, PullRequest,
    PullResult, PushRequest, PushResult, RefreshRequest, RegisterRequest, SyncRecord,
};
use super::session::{TokenProvider, TokenSaver};
use super::transport::SyncTransport;
use crate::config::{Config, DEFAULT_PULL_BATCH_SIZE, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::models::Checkpoint;

const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the `/auth` and `/sync/{appId}` endpoints
pub struct SyncProtocolClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    api_key: Option<String>,
    batch_size: u32,
    tokens: Arc<dyn TokenProvider>,
    saver: Arc<dyn TokenSaver>,
}

impl SyncProtocolClient {
    /// Create a client for `base_url` (which may include a path prefix)
    pub fn new(
        base_url: &str,
        app_id: &str,
        tokens: Arc<dyn TokenProvider>,
        saver: Arc<dyn TokenSaver>,
    ) -> Result<Self, SyncError> {
        Self::build(
            base_url,
            app_id,
            tokens,
            saver,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    /// Create a client from configuration, sharing one session for both
    /// reading and saving tokens
    pub fn from_config<S>(config: &Config, session: Arc<S>) -> Result<Self, SyncError>
    where
        S: TokenProvider + TokenSaver + 'static,
    {
        let server_url = config
            .server_url
            .as_deref()
            .ok_or_else(|| SyncError::NotConfigured("server_url is not set".into()))?;
        let app_id = config
            .app_id
            .as_deref()
            .ok_or_else(|| SyncError::NotConfigured("app_id is not set".into()))?;

        let mut client = Self::build(
            server_url,
            app_id,
            session.clone(),
            session,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        client.api_key = config.api_key.clone();
        client.batch_size = config.pull_batch_size;
        Ok(client)
    }

    fn build(
        base_url: &str,
        app_id: &str,
        tokens: Arc<dyn TokenProvider>,
        saver: Arc<dyn TokenSaver>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            api_key: None,
            batch_size: DEFAULT_PULL_BATCH_SIZE,
            tokens,
            saver,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn sync_path(&self, operation: &str) -> String {
        format!("/sync/{}/{}", self.app_id, operation)
    }

    fn headers(&self, token: Option<&str>) -> Result<HeaderMap, SyncError> {
        let mut headers = HeaderMap::new();

        let app_id = HeaderValue::from_str(&self.app_id)
            .map_err(|_| SyncError::NotConfigured("app_id contains invalid characters".into()))?;
        headers.insert("x-app-id", app_id);

        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key).map_err(|_| {
                SyncError::NotConfigured("api_key contains invalid characters".into())
            })?;
            headers.insert("x-api-key", value);
        }

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| SyncError::AuthenticationFailed("Invalid access token format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!(%status, "sync server response");
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!(%status, body = %preview, "sync server error response");
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SyncError> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::AuthenticationExpired);
        }

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(ApiErrorBody::text)
                .unwrap_or_else(|| format!("Request failed: {}", body));
            return Err(SyncError::api(status.as_u16(), message));
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn send<B, T>(&self, path: &str, body: &B, token: Option<&str>) -> Result<T, SyncError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(path, "POST");
        let response = self
            .http
            .post(self.url(path))
            .headers(self.headers(token)?)
            .json(body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Send with the current access token, refreshing once on 401
    async fn post_authorized<B, T>(&self, path: &str, body: &B) -> Result<T, SyncError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self
            .tokens
            .access_token()
            .ok_or(SyncError::NotAuthenticated)?;

        match self.send(path, body, Some(&token)).await {
            Err(SyncError::AuthenticationExpired) => {
                info!("Access token rejected, refreshing");
                let token = self.refresh().await?;
                match self.send(path, body, Some(&token)).await {
                    Err(SyncError::AuthenticationExpired) => Err(SyncError::AuthenticationFailed(
                        "Server rejected the refreshed token".into(),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Exchange the refresh token for a new token pair
    async fn refresh(&self) -> Result<String, SyncError> {
        let refresh_token = self.tokens.refresh_token().ok_or_else(|| {
            SyncError::AuthenticationFailed("No refresh token available".into())
        })?;

        let request = RefreshRequest { refresh_token };
        let response: AuthResponse = match self.send("/auth/refresh", &request, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return Err(SyncError::AuthenticationFailed(format!(
                    "Token refresh failed: {}",
                    e
                )));
            }
        };

        self.saver.save_tokens(
            &response.access_token,
            response.refresh_token.as_deref(),
            response.user_id.as_deref(),
        );
        Ok(response.access_token)
    }

    async fn authenticate<B: Serialize>(&self, path: &str, body: &B) -> Result<AuthResponse, SyncError> {
        let response: AuthResponse = match self.send(path, body, None).await {
            Ok(response) => response,
            Err(SyncError::AuthenticationExpired) => {
                return Err(SyncError::AuthenticationFailed("Invalid credentials".into()))
            }
            Err(e) => return Err(e),
        };

        self.saver.save_tokens(
            &response.access_token,
            response.refresh_token.as_deref(),
            response.user_id.as_deref(),
        );
        Ok(response)
    }

    /// Log in and store the returned tokens
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, SyncError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response = self.authenticate("/auth/login", &request).await?;
        info!(user_id = ?response.user_id, "Logged in");
        Ok(response)
    }

    /// Create an account and store the returned tokens
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthResponse, SyncError> {
        let request = RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let response = self.authenticate("/auth/register", &request).await?;
        info!(user_id = ?response.user_id, "Registered");
        Ok(response)
    }

    fn pull_request(&self, checkpoint: Option<Checkpoint>, batch_size: Option<u32>) -> PullRequest {
        PullRequest {
            checkpoint,
            batch_size: batch_size.unwrap_or(self.batch_size),
        }
    }
}

#[async_trait]
impl SyncTransport for SyncProtocolClient {
    fn has_credentials(&self) -> bool {
        self.tokens.access_token().is_some()
    }

    async fn push(&self, records: Vec<SyncRecord>) -> Result<PushResult, SyncError> {
        let request = PushRequest {
            records,
            client_timestamp: Utc::now().timestamp_millis(),
        };
        self.post_authorized(&self.sync_path("push"), &request).await
    }

    async fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: Option<u32>,
    ) -> Result<PullResult, SyncError> {
        let request = self.pull_request(checkpoint, batch_size);
        self.post_authorized(&self.sync_path("pull"), &request).await
    }

    async fn delta(
        &self,
        records: Vec<SyncRecord>,
        checkpoint: Option<Checkpoint>,
        batch_size: Option<u32>,
    ) -> Result<DeltaResponse, SyncError> {
        let push = (!records.is_empty()).then(|| PushRequest {
            records,
            client_timestamp: Utc::now().timestamp_millis(),
        });
        let request = DeltaRequest {
            push,
            pull: self.pull_request(checkpoint, batch_size),
        };
        self.post_authorized(&self.sync_path("delta"), &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::session::SessionStore;
    use httpmock::prelude::*;
    use serde_json::json;

    fn session(access: Option<&str>, refresh: Option<&str>) -> Arc<SessionStore> {
        let session = Arc::new(SessionStore::new());
        if let Some(access) = access {
            session.save_tokens(access, refresh, None);
        }
        session
    }

    fn client(server: &MockServer, session: Arc<SessionStore>) -> SyncProtocolClient {
        SyncProtocolClient::new(&server.url("/api/v1"), "folio", session.clone(), session)
            .unwrap()
            .with_api_key("key-1")
    }

    fn record() -> SyncRecord {
        SyncRecord {
            table_name: "portfolios".to_string(),
            row_id: "p-1".to_string(),
            data: json!({"name": "Main"}),
            version: 1,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_push_sends_headers_and_records() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/sync/folio/push")
                    .header("authorization", "Bearer access-1")
                    .header("x-api-key", "key-1")
                    .header("x-app-id", "folio")
                    .body_contains("\"rowId\":\"p-1\"")
                    .body_contains("clientTimestamp");
                then.status(200).json_body(json!({"synced": 1, "conflicts": []}));
            })
            .await;

        let client = client(&server, session(Some("access-1"), None));
        let result = client.push(vec![record()]).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.synced, 1);
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_refreshes_once_and_retries() {
        let server = MockServer::start_async().await;
        let expired = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/sync/folio/pull")
                    .header("authorization", "Bearer old");
                then.status(401).json_body(json!({"error": "token expired"}));
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/auth/refresh")
                    .body_contains("refresh-1");
                then.status(200)
                    .json_body(json!({"accessToken": "new", "refreshToken": "refresh-2"}));
            })
            .await;
        let retried = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/sync/folio/pull")
                    .header("authorization", "Bearer new");
                then.status(200).json_body(json!({
                    "records": [],
                    "checkpoint": {"ts": 10},
                    "hasMore": false
                }));
            })
            .await;

        let session = session(Some("old"), Some("refresh-1"));
        let client = client(&server, session.clone());
        let page = client.pull(None, Some(50)).await.unwrap();

        expired.assert_hits_async(1).await;
        refresh.assert_hits_async(1).await;
        retried.assert_hits_async(1).await;
        assert_eq!(page.checkpoint, Some(Checkpoint(json!({"ts": 10}))));
        assert_eq!(session.access_token().as_deref(), Some("new"));
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_second_unauthorized_fails() {
        let server = MockServer::start_async().await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/sync/folio/push");
                then.status(401);
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/auth/refresh");
                then.status(200).json_body(json!({"accessToken": "new"}));
            })
            .await;

        let client = client(&server, session(Some("old"), Some("refresh-1")));
        let err = client.push(vec![record()]).await.unwrap_err();

        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        push.assert_hits_async(2).await;
        refresh.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_retry() {
        let server = MockServer::start_async().await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/sync/folio/push");
                then.status(401);
            })
            .await;
        let refresh = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/auth/refresh");
                then.status(200).json_body(json!({"accessToken": "new"}));
            })
            .await;

        let client = client(&server, session(Some("old"), None));
        let err = client.push(vec![record()]).await.unwrap_err();

        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        push.assert_hits_async(1).await;
        refresh.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_failed_refresh_is_terminal() {
        let server = MockServer::start_async().await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/sync/folio/push");
                then.status(401);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/auth/refresh");
                then.status(401).json_body(json!({"error": "refresh token revoked"}));
            })
            .await;

        let client = client(&server, session(Some("old"), Some("refresh-1")));
        let err = client.push(vec![record()]).await.unwrap_err();

        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        push.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_no_token_is_not_authenticated() {
        let server = MockServer::start_async().await;
        let push = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/sync/folio/push");
                then.status(200).json_body(json!({"synced": 0}));
            })
            .await;

        let client = client(&server, session(None, None));
        assert!(!client.has_credentials());

        let err = client.push(vec![record()]).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        push.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_delta_without_records_omits_push() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/sync/folio/delta")
                    .json_body(json!({"pull": {"batchSize": 100}}));
                then.status(200).json_body(json!({
                    "pullResult": {"records": [], "checkpoint": "cp-1", "hasMore": false}
                }));
            })
            .await;

        let client = client(&server, session(Some("access-1"), None));
        let response = client.delta(Vec::new(), None, None).await.unwrap();

        mock.assert_async().await;
        assert!(response.push.is_none());
        assert_eq!(
            response.pull.unwrap().checkpoint,
            Some(Checkpoint(json!("cp-1")))
        );
    }

    #[tokio::test]
    async fn test_api_error_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/sync/folio/pull");
                then.status(503).json_body(json!({"message": "maintenance"}));
            })
            .await;

        let client = client(&server, session(Some("access-1"), None));
        let err = client.pull(None, None).await.unwrap_err();

        match err {
            SyncError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_saves_tokens() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/auth/login")
                    .body_contains("ana@example.com");
                then.status(200).json_body(json!({
                    "accessToken": "access-1",
                    "refreshToken": "refresh-1",
                    "userId": "u-1"
                }));
            })
            .await;

        let session = session(None, None);
        let client = client(&server, session.clone());
        let response = client.login("ana@example.com", "secret").await.unwrap();

        assert_eq!(response.user_id.as_deref(), Some("u-1"));
        assert!(client.has_credentials());
        assert_eq!(session.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/auth/login");
                then.status(401).json_body(json!({"error": "invalid credentials"}));
            })
            .await;

        let client = client(&server, session(None, None));
        let err = client.login("ana@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        assert!(!client.has_credentials());
    }

    #[test]
    fn test_from_config_requires_server() {
        let config = Config::default();
        let err = SyncProtocolClient::from_config(&config, Arc::new(SessionStore::new()))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::NotConfigured(_)));
    }
}
