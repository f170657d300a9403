//! Error types for MediaFetch core

use thiserror::Error;

/// Errors that can occur in MediaFetch core
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Connection closed after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("Unexpected response status: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u16, actual: u16 },

    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to resolve {url}: {reason}")]
    Resolution { url: String, reason: String },

    #[error("No resolver accepts {0}")]
    UnsupportedUrl(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Playlist contains no segments: {0}")]
    EmptyPlaylist(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service is shut down")]
    Shutdown,

    #[error("Transfer {job_id} of {url} failed after {attempts} attempt(s): {source}")]
    Transfer {
        job_id: String,
        url: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => !e.is_builder() && !e.is_redirect(),
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Incomplete { .. } | FetchError::ProtocolMismatch { .. } => true,
            FetchError::Transfer { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        match self {
            FetchError::Cancelled => true,
            FetchError::Transfer { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Check if the downloaded bytes failed integrity verification
    pub fn is_verification(&self) -> bool {
        match self {
            FetchError::SizeMismatch { .. } | FetchError::ChecksumMismatch { .. } => true,
            FetchError::Transfer { source, .. } => source.is_verification(),
            _ => false,
        }
    }

    /// The innermost error, looking through transfer context
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::Transfer { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn in_transfer(self, job_id: &str, url: &str, attempts: u32) -> Self {
        match self {
            e @ FetchError::Transfer { .. } => e,
            e => FetchError::Transfer {
                job_id: job_id.to_string(),
                url: url.to_string(),
                attempts,
                source: Box::new(e),
            },
        }
    }
}

impl From<sqlx::Error> for FetchError {
    fn from(error: sqlx::Error) -> Self {
        FetchError::Persistence(error.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::Serialization(error.to_string())
    }
}

impl From<url::ParseError> for FetchError {
    fn from(error: url::ParseError) -> Self {
        FetchError::Configuration(format!("invalid URL: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_looks_through_transfer_context() {
        let err = FetchError::Status {
            status: 503,
            url: "http://example.com".into(),
        }
        .in_transfer("job", "http://example.com", 2);
        assert!(err.is_retryable());
        assert!(!err.is_cancelled());

        let cancelled = FetchError::Cancelled.in_transfer("job", "u", 1);
        assert!(cancelled.is_cancelled());
        assert!(matches!(cancelled.root(), FetchError::Cancelled));
    }

    #[test]
    fn client_errors_and_verification_are_not_retried() {
        let not_found = FetchError::Status {
            status: 404,
            url: "http://example.com".into(),
        };
        assert!(!not_found.is_retryable());

        let mismatch = FetchError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.is_verification());
    }

    #[test]
    fn transfer_context_is_not_nested_twice() {
        let err = FetchError::Cancelled
            .in_transfer("a", "u", 1)
            .in_transfer("b", "u", 3);
        match err {
            FetchError::Transfer { job_id, attempts, .. } => {
                assert_eq!(job_id, "a");
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
