//! Sync Transport - HTTP communication with the sync server
//!
//! The engine talks to the remote authority through the `Transport`
//! trait: one call sends a batch of client messages and returns the
//! server's acknowledgement plus any server-to-client messages, one
//! call fetches a page of history records. `HttpTransport` is the
//! production implementation; tests substitute their own.
//!
//! The JSON envelope used here is a convenience, not a protocol
//! commitment - the wire format is owned by the server.

use super::messages::ClientMessage;
use crate::store::models::EntityKind;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reply to one batch send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Server durably accepted the batch; consumed outstanding entries
    /// may now be deleted
    pub acked: bool,

    /// Server clock, milliseconds; advances the pushed-at watermarks
    pub server_time: i64,

    /// Server-to-client messages, to be applied strictly in order
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// One record of a history page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub uuid: String,
    pub actor_id: String,
    pub action: String,
    #[serde(default)]
    pub message: String,
    pub target_uuid: String,
    pub created_at: i64,
}

/// One page of a paginated history fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub has_more: bool,
}

/// Transport to the remote authority
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one batch of outbound messages, returning the ack and any
    /// inbound messages the server piggybacks on the reply
    async fn send_batch(&self, batch: &[ClientMessage]) -> Result<SyncResponse, ApiError>;

    /// Fetch one page of history records for an entity
    async fn fetch_history_page(
        &self,
        kind: EntityKind,
        uuid: &str,
        modified_after: i64,
        offset: i64,
    ) -> Result<HistoryPage, ApiError>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// HTTP transport for the Tasknest sync server
pub struct HttpTransport {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(ApiError::Request)?,
            base_url: base_url.into(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    async fn token(&self) -> Result<String, ApiError> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    messages: &'a [ClientMessage],
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[ClientMessage]) -> Result<SyncResponse, ApiError> {
        let token = self.token().await?;

        let response = self
            .client
            .post(format!("{}/sync/batch", self.base_url))
            .bearer_auth(token)
            .json(&BatchRequest { messages: batch })
            .send()
            .await?;

        handle_response(response).await
    }

    async fn fetch_history_page(
        &self,
        kind: EntityKind,
        uuid: &str,
        modified_after: i64,
        offset: i64,
    ) -> Result<HistoryPage, ApiError> {
        let token = self.token().await?;

        let response = self
            .client
            .get(format!("{}/history/{}/{}", self.base_url, kind.as_str(), uuid))
            .query(&[
                ("modified_after", modified_after.to_string()),
                ("offset", offset.to_string()),
            ])
            .bearer_auth(token)
            .send()
            .await?;

        handle_response(response).await
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Server rejected the batch")]
    Rejected,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| ApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimitExceeded,
        StatusCode::INTERNAL_SERVER_ERROR => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::ServerError(msg)
        }
        _ => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_management() {
        let transport = HttpTransport::new("http://localhost:9").unwrap();
        assert!(matches!(
            transport.token().await,
            Err(ApiError::Unauthorized)
        ));

        transport.set_token("test_token".to_string()).await;
        assert_eq!(transport.token().await.unwrap(), "test_token");

        transport.clear_token().await;
        assert!(matches!(
            transport.token().await,
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_send_batch_http_roundtrip() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("POST", "/sync/batch")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                "acked": true,
                "server_time": 1700000000000,
                "messages": [{"type": "user_migrated", "prev_user_id": "u1", "new_user_id": "u2"}]
            }"#,
            )
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url()).unwrap();
        transport.set_token("t".to_string()).await;

        let response = transport.send_batch(&[]).await.unwrap();
        assert!(response.acked);
        assert_eq!(response.server_time, 1_700_000_000_000);
        assert_eq!(response.messages.len(), 1);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_maps_to_typed_error() {
        let mut server = mockito::Server::new_async().await;

        let _mock = server
            .mock("POST", "/sync/batch")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let transport = HttpTransport::new(server.url()).unwrap();
        transport.set_token("t".to_string()).await;

        let result = transport.send_batch(&[]).await;
        assert!(matches!(result, Err(ApiError::ServerError(_))));
    }
}
