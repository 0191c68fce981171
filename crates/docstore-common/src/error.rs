//! Error types for docstore

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for docstore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// MongoDB server error code for a unique index violation
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Lifecycle step a scoped operation was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Connect,
    Ping,
    Operation,
    Iteration,
    Release,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Connect => "connect",
            Step::Ping => "ping",
            Step::Operation => "operation",
            Step::Iteration => "cursor iteration",
            Step::Release => "release",
        };
        f.write_str(name)
    }
}

/// Unified error type for all docstore operations
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// URI invalid or server unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Server reachable but the primary did not answer the ping
    #[error("Liveness check failed: {0}")]
    Liveness(String),

    /// The store rejected or could not complete the operation
    #[error("Operation error: {0}")]
    Operation(String),

    /// Write rejected because of a duplicate key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A multi-result read failed before the cursor was exhausted
    #[error("Cursor iteration error: {0}")]
    Iteration(String),

    #[error("Timeout: {step} did not complete within {limit:?}")]
    Timeout { step: Step, limit: Duration },

    #[error("No document matched in {database}.{collection}")]
    NotFound { database: String, collection: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    /// Returns true if a lifecycle step ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }

    /// Returns true if a single-document read matched nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// The lifecycle step this error belongs to, if it came from one
    pub fn step(&self) -> Option<Step> {
        match self {
            StoreError::Connection(_) => Some(Step::Connect),
            StoreError::Liveness(_) => Some(Step::Ping),
            StoreError::Operation(_) | StoreError::Conflict(_) | StoreError::NotFound { .. } => {
                Some(Step::Operation)
            }
            StoreError::Iteration(_) => Some(Step::Iteration),
            StoreError::Timeout { step, .. } => Some(*step),
            StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Configuration(_) => None,
        }
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            StoreError::Conflict(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

#[cfg(feature = "mongodb-errors")]
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|w| w.code == DUPLICATE_KEY_CODE)),
        _ => false,
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for StoreError {
    fn from(err: bson::ser::Error) -> Self {
        StoreError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for StoreError {
    fn from(err: bson::de::Error) -> Self {
        StoreError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = StoreError::Connection("connection refused".to_string());
        assert_eq!(err.to_string(), "Connection error: connection refused");
    }

    #[test]
    fn test_error_display_liveness() {
        let err = StoreError::Liveness("no primary".to_string());
        assert_eq!(err.to_string(), "Liveness check failed: no primary");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = StoreError::Timeout {
            step: Step::Iteration,
            limit: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "Timeout: cursor iteration did not complete within 30s"
        );
    }

    #[test]
    fn test_error_display_not_found() {
        let err = StoreError::NotFound {
            database: "shop".to_string(),
            collection: "products".to_string(),
        };
        assert_eq!(err.to_string(), "No document matched in shop.products");
    }

    #[test]
    fn test_is_timeout() {
        assert!(StoreError::Timeout {
            step: Step::Connect,
            limit: Duration::from_secs(10)
        }
        .is_timeout());
        assert!(!StoreError::Connection("test".to_string()).is_timeout());
    }

    #[test]
    fn test_is_not_found() {
        let err = StoreError::NotFound {
            database: "a".to_string(),
            collection: "b".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!StoreError::Operation("test".to_string()).is_not_found());
    }

    #[test]
    fn test_step_classification() {
        assert_eq!(StoreError::Connection("x".into()).step(), Some(Step::Connect));
        assert_eq!(StoreError::Liveness("x".into()).step(), Some(Step::Ping));
        assert_eq!(StoreError::Conflict("x".into()).step(), Some(Step::Operation));
        assert_eq!(StoreError::Iteration("x".into()).step(), Some(Step::Iteration));
        assert_eq!(
            StoreError::Timeout {
                step: Step::Release,
                limit: Duration::from_secs(1)
            }
            .step(),
            Some(Step::Release)
        );
        assert_eq!(StoreError::Serialization("x".into()).step(), None);
    }

    #[test]
    #[allow(clippy::unnecessary_literal_unwrap)]
    fn test_result_type_ok() {
        let result: Result<u64> = Ok(4);
        assert_eq!(result.unwrap(), 4);
    }
}
