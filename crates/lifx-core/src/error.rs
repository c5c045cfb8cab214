//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur when building domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Label does not fit in the fixed-size wire field
    #[error("label too long: {len} bytes (max {max})")]
    LabelTooLong { len: usize, max: usize },

    /// Tag id outside of the 64 slots a gateway offers
    #[error("invalid tag id: {0} (expected 0..64)")]
    InvalidTagId(u32),

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::LabelTooLong { len: 40, max: 31 };
        assert_eq!(err.to_string(), "label too long: 40 bytes (max 31)");

        let err = DomainError::InvalidTagId(64);
        assert_eq!(err.to_string(), "invalid tag id: 64 (expected 0..64)");

        let err = DomainError::ParseError {
            field: "device address".to_string(),
            reason: "not hexadecimal".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to parse device address: not hexadecimal"
        );
    }
}
