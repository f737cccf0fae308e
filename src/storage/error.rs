//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum DbError {
    /// Primary key is not present in the database
    #[error("Primary key not found: {0}")]
    NotFound(String),

    /// Primary key is already present in the database
    #[error("Primary key already exists: {0}")]
    AlreadyExists(String),

    /// Incompatible series length or missing/unknown metadata field
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Malformed series, predicate or argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum or structural mismatch detected in a persisted file
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Stable error-kind identifier for the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::NotFound(_) => "NotFound",
            DbError::AlreadyExists(_) => "AlreadyExists",
            DbError::SchemaMismatch(_) => "SchemaMismatch",
            DbError::InvalidArgument(_) => "InvalidArgument",
            DbError::Io(_) => "IOFailure",
            DbError::Corruption(_) => "Integrity",
            DbError::Serialization(_) => "Integrity",
        }
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::NotFound("ts-0".to_string());
        assert_eq!(err.to_string(), "Primary key not found: ts-0");

        let err = DbError::SchemaMismatch("series length 50 != 100".to_string());
        assert_eq!(err.to_string(), "Schema mismatch: series length 50 != 100");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DbError::NotFound(String::new()).kind(), "NotFound");
        assert_eq!(DbError::AlreadyExists(String::new()).kind(), "AlreadyExists");
        assert_eq!(DbError::Corruption(String::new()).kind(), "Integrity");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let db_err: DbError = io_err.into();
        assert!(matches!(db_err, DbError::Io(_)));
        assert_eq!(db_err.kind(), "IOFailure");
    }
}
