//! Error types for Rowkeep
//!
//! Internal failures (I/O, corrupted binlog, schema problems). Client-facing
//! outcomes are reported with [`crate::ErrorCode`] instead.

use thiserror::Error;

/// Common result type for Rowkeep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Rowkeep
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("binlog corrupted: {0}")]
    Corruption(String),

    #[error("checksum mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("sql error: {0}")]
    Sql(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service stopped")]
    Stopped,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Whether the on-disk log can no longer be trusted
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::ChecksumMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_corruption() {
        assert!(Error::corruption("bad opcode").is_corruption());
        assert!(
            Error::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .is_corruption()
        );
        assert!(!Error::storage("disk gone").is_corruption());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ChecksumMismatch {
            expected: 0xff,
            actual: 0,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 0x00000000000000ff, got 0x0000000000000000"
        );
    }
}
