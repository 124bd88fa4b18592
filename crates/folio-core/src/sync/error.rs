//! Sync error types

use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

/// How a caller should treat a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiRetryClass {
    /// Safe to try again on the next cycle
    Retryable,
    /// Will keep failing until something changes
    Permanent,
    /// The user has to log in again
    ReauthRequired,
}

/// Errors raised while talking to the sync server or committing a cycle
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),

    #[error("Not logged in")]
    NotAuthenticated,

    /// Access token rejected; refreshed and retried once by the client
    #[error("Access token expired")]
    AuthenticationExpired,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("A sync cycle is already running")]
    AlreadyRunning,
}

impl SyncError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::NotAuthenticated | Self::AuthenticationExpired | Self::AuthenticationFailed(_) => {
                ApiRetryClass::ReauthRequired
            }
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Network(_) | Self::AlreadyRunning => ApiRetryClass::Retryable,
            Self::Storage(err) if err.is_recoverable() => ApiRetryClass::Retryable,
            Self::NotConfigured(_) | Self::Json(_) | Self::Protocol(_) | Self::Storage(_) => {
                ApiRetryClass::Permanent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_class_by_status() {
        assert_eq!(
            SyncError::api(401, "expired").retry_class(),
            ApiRetryClass::ReauthRequired
        );
        assert_eq!(
            SyncError::api(429, "slow down").retry_class(),
            ApiRetryClass::Retryable
        );
        assert_eq!(
            SyncError::api(503, "maintenance").retry_class(),
            ApiRetryClass::Retryable
        );
        assert_eq!(
            SyncError::api(400, "bad request").retry_class(),
            ApiRetryClass::Permanent
        );
    }

    #[test]
    fn test_retry_class_for_local_errors() {
        assert_eq!(
            SyncError::NotAuthenticated.retry_class(),
            ApiRetryClass::ReauthRequired
        );
        assert_eq!(
            SyncError::Protocol("stuck checkpoint".into()).retry_class(),
            ApiRetryClass::Permanent
        );
        assert_eq!(SyncError::AlreadyRunning.retry_class(), ApiRetryClass::Retryable);
    }

    #[test]
    fn test_storage_errors_display_inner_message() {
        let err = SyncError::from(StorageError::not_found("portfolios", "p-1"));
        assert_eq!(
            err.to_string(),
            StorageError::not_found("portfolios", "p-1").to_string()
        );
    }
}
