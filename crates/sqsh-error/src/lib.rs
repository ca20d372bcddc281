#![forbid(unsafe_code)]
//! Error types for the sqsh toolkit.
//!
//! Defines `SqshError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all sqsh operations.
#[derive(Debug, Error)]
pub enum SqshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compressor failure: {0}")]
    Compression(String),

    #[error("unsupported compressor: {0}")]
    UnsupportedCompressor(String),

    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    #[error("tree invariant violated: {0}")]
    TreeInvariant(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("field overflow: {field} does not fit even the extended form")]
    Overflow { field: &'static str },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl SqshError {
    /// Build an `InvalidFormat` error from anything displayable.
    pub fn format(msg: impl std::fmt::Display) -> Self {
        Self::InvalidFormat(msg.to_string())
    }

    /// Build a `TreeInvariant` error from anything displayable.
    pub fn tree(msg: impl std::fmt::Display) -> Self {
        Self::TreeInvariant(msg.to_string())
    }
}

/// Result alias using `SqshError`.
pub type Result<T> = std::result::Result<T, SqshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/nonexistent/sqsh-test-path")?)
        }
        let err = open_missing().unwrap_err();
        assert!(matches!(err, SqshError::Io(_)));
    }

    #[test]
    fn display_includes_detail() {
        let err = SqshError::UnsupportedCompressor("lzo".to_owned());
        assert_eq!(err.to_string(), "unsupported compressor: lzo");

        let err = SqshError::Overflow { field: "file_size" };
        assert!(err.to_string().contains("file_size"));
    }
}
