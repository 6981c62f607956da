//! Error types for larder.
//!
//! Library crates use [`LarderError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Variants describe *what* went wrong. Whether a failure is retried is decided
//! by the retry policy in `larder-core`, never by the code that raised it.

use std::path::PathBuf;

/// Top-level error type for all larder operations.
#[derive(Debug, thiserror::Error)]
pub enum LarderError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the source, transform service, or asset host.
    #[error("network error: {0}")]
    Network(String),

    /// A call exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote side asked us to slow down (HTTP 429 or quota exhausted).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The requested item or asset does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTML or service-output parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Transform service returned an error response.
    #[error("transform error: {0}")]
    Transform(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, rejected record, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LarderError>;

impl LarderError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error reports a missing upstream resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LarderError::config("batch_size must be at least 1");
        assert_eq!(err.to_string(), "config error: batch_size must be at least 1");

        let err = LarderError::NotFound("recipe 6912345".into());
        assert!(err.to_string().contains("6912345"));
        assert!(err.is_not_found());
    }

    #[test]
    fn io_error_keeps_path() {
        let err = LarderError::io(
            "/tmp/assets/1.jpg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/assets/1.jpg"));
        assert!(!err.is_not_found());
    }
}
