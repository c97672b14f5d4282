//! Error types for metadata indexer operations.
//!
//! This module defines a single error enumeration using `thiserror` that is
//! shared by the URI parsers, the resolver, the scanner and every persistence
//! backend, so that callers can inspect error identity (see
//! [`MetadataIndexerError::is_retryable`]).

use thiserror::Error;

/// Custom error type for metadata indexer operations.
#[derive(Debug, Error)]
pub enum MetadataIndexerError {
    /// The link could not be parsed as a URI of the expected scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The link does not start with the prefix required by the parser.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// The IPFS link does not carry a valid CIDv0 or CIDv1.
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    /// The IPFS adapter was built without any gateway.
    #[error("empty IPFS gateway list")]
    EmptyIpfsGatewayList,

    /// Every configured IPFS gateway failed to return the document.
    #[error("no IPFS response: {0}")]
    NoIpfsResponse(String),

    /// Transport-level failure or a non-200 response.
    #[error("HTTP request error: {0}")]
    HttpRequest(String),

    /// No adapter accepts the link.
    #[error("unknown storage type: {0}")]
    UnknownStorageType(String),

    /// The `tezos-storage:` key is absent from the context store.
    #[error("tezos storage key not found: {0}")]
    TezosStorageKeyNotFound(String),

    /// The fetched payload is not valid JSON (or not valid UTF-8).
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The payload behind a `sha256://` link does not hash to the expected value.
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// Hash announced by the link.
        expected: String,
        /// Hash of the fetched payload.
        actual: String,
    },

    /// Errors encountered during relational database operations.
    ///
    /// Wraps `sqlx::Error` so that `?` propagates it directly.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Errors reported by the document-search backend.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Chain observer connection failures (HTTP API or event subscription).
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A big-map update or an observer message could not be decoded.
    #[error("decoding error: {0}")]
    DecodingError(String),

    /// I/O failures (configuration and mapping files).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Catch-all for failures that don't fit other categories.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Type alias for Results using `MetadataIndexerError`.
pub type Result<T> = std::result::Result<T, MetadataIndexerError>;

impl From<serde_json::Error> for MetadataIndexerError {
    fn from(err: serde_json::Error) -> Self {
        MetadataIndexerError::InvalidJson(err.to_string())
    }
}

impl From<serde_yaml::Error> for MetadataIndexerError {
    fn from(err: serde_yaml::Error) -> Self {
        MetadataIndexerError::ConfigError(err.to_string())
    }
}

impl MetadataIndexerError {
    /// Returns `true` if a failed resolution may succeed on a later tick.
    ///
    /// | Error variant             | Retried | Reason                                 |
    /// |---------------------------|---------|----------------------------------------|
    /// | `NoIpfsResponse`          | yes     | Content may not have propagated yet    |
    /// | `TezosStorageKeyNotFound` | yes     | The key may be set in a later block    |
    /// | anything else             | no      | Bad links and bad payloads stay bad    |
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetadataIndexerError::NoIpfsResponse(_)
                | MetadataIndexerError::TezosStorageKeyNotFound(_)
        )
    }

    /// Returns `true` for errors raised by a persistence backend.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            MetadataIndexerError::DatabaseError(_) | MetadataIndexerError::BackendError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(MetadataIndexerError::NoIpfsResponse("Qm".into()).is_retryable());
        assert!(MetadataIndexerError::TezosStorageKeyNotFound("k".into()).is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!MetadataIndexerError::HttpRequest("404".into()).is_retryable());
        assert!(!MetadataIndexerError::InvalidJson("eof".into()).is_retryable());
        assert!(!MetadataIndexerError::UnknownStorageType("ftp://".into()).is_retryable());
        assert!(!MetadataIndexerError::InvalidCid("x".into()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MetadataIndexerError = err.into();
        assert!(matches!(err, MetadataIndexerError::InvalidJson(_)));
    }

    #[test]
    fn test_backend_family() {
        assert!(MetadataIndexerError::BackendError("bulk".into()).is_backend());
        assert!(!MetadataIndexerError::ConfigError("x".into()).is_backend());
    }
}
