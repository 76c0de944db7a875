//! Error types shared by the audit recorder and its tooling.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or interpreting audit data.
#[derive(Error, Debug)]
pub enum Error {
    /// A document field is missing or has an unexpected shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the offending field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A framed record failed its length or checksum verification.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A time window expression could not be parsed.
    #[error("unknown time window '{0}'")]
    InvalidWindow(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidField`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::invalid("rid", "expected string, found int32");
        let msg = err.to_string();
        assert!(msg.contains("rid"));
        assert!(msg.contains("expected string"));
    }

    #[test]
    fn test_integrity_display() {
        let err = Error::Integrity("checksum mismatch at offset 120".to_string());
        assert!(err.to_string().contains("integrity check failed"));
        assert!(err.to_string().contains("offset 120"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
