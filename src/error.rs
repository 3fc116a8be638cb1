//! Error types shared by the store backends and the coordination layer.
//!
//! Store failures never reach business logic directly: every component maps
//! a [`StoreError`] onto its own safe default (miss, allow, none, invalid).
//! The only component that surfaces them is token issuance, where handing out
//! a QR code that was never stored would be worse than failing the request.

use std::time::Duration;

use thiserror::Error;

/// Failure talking to the shared key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, dropped, or the backend replied with an error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The bounded per-command timeout elapsed.
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// The backend replied with something the caller could not interpret.
    #[error("unexpected store reply: {0}")]
    Protocol(String),

    /// A value could not be encoded or decoded as JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Client timeouts are classified by the backend, which knows its configured
/// limit; here they count as the store being unavailable.
impl From<fred::error::Error> for StoreError {
    fn from(err: fred::error::Error) -> Self {
        match err.kind() {
            fred::error::ErrorKind::Parse => StoreError::Protocol(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Failure issuing a one-time token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// A live token with the same id already exists.
    #[error("token {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_includes_duration() {
        let err = StoreError::Timeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "store command timed out after 500ms");
    }

    #[test]
    fn client_errors_never_claim_a_zero_timeout() {
        let err = fred::error::Error::new(fred::error::ErrorKind::Timeout, "request timed out");
        assert!(matches!(StoreError::from(err), StoreError::Unavailable(_)));

        let err = fred::error::Error::new(fred::error::ErrorKind::Parse, "bad integer");
        assert!(matches!(StoreError::from(err), StoreError::Protocol(_)));
    }

    #[test]
    fn token_error_wraps_store_error() {
        let err: TokenError = StoreError::Unavailable("connection refused".into()).into();
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }
}
