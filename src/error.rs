//! Error types for the random access cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache engines
///
/// Most of these never reach an application: the read and write paths of
/// the engines log them and degrade to a miss or a dropped write.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // File Format Errors
    // =========================================================================
    /// File does not carry the cache identifier
    #[error("Not a random access cache file: {0}")]
    Format(String),

    /// File was written by a different format version
    #[error("Cache file is format version {found} but this build supports version {expected}")]
    VersionMismatch { found: i32, expected: i32 },

    /// Unrecognized entry code or truncated record
    #[error("Corrupt cache record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// Key or object package larger than a 32-bit length field can describe
    #[error("Serialized package of {size} bytes exceeds the 4 GiB record limit")]
    PackageTooLarge { size: usize },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Key or object package failed to (de)serialize
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The OS file locking primitive itself failed (not mere contention)
    #[error("Failed to lock cache file {path}: {source}")]
    LockAcquisition {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Service Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No cache type of that name has been created yet
    #[error("Unknown cache type: {0}")]
    UnknownCache(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a corrupt record error
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_message() {
        let err = Error::VersionMismatch {
            found: 2,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "Cache file is format version 2 but this build supports version 1"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_corrupt_helper() {
        let err = Error::corrupt(42, "unrecognized entry code 0x00");
        assert!(err.to_string().contains("offset 42"));
    }
}
