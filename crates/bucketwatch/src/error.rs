//! Error types for the notification engine

use thiserror::Error;

use crate::types::{HandlerId, ListenerId, NotificationId};

/// Errors raised while managing notifications, listeners and handlers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// More than one active notification covers the same bucket path.
    #[error("found overlapping active notifications covering s3://{bucket}/{}", prefix.as_deref().unwrap_or(""))]
    OverlappingNotifications {
        /// Bucket being queried
        bucket: String,
        /// Prefix being queried
        prefix: Option<String>,
    },
    /// A config id about to be inserted already exists on the bucket.
    #[error("notification config id already present: {0}")]
    DuplicateConfigId(String),
    /// No listener with this id.
    #[error("no listener with id {0}")]
    ListenerNotFound(ListenerId),
    /// The listener exists but was already deactivated.
    #[error("listener {0} is already deactivated")]
    ListenerInactive(ListenerId),
    /// No notification with this id.
    #[error("no notification with id {0}")]
    NotificationNotFound(NotificationId),
    /// No handler with this id.
    #[error("no handler with id {0}")]
    HandlerNotFound(HandlerId),
    /// Every consolidation attempt failed.
    #[error("unable to retrieve covering notification for s3://{bucket}/{} after {attempts} attempts", prefix.as_deref().unwrap_or(""))]
    ConsolidationExhausted {
        /// Bucket of the new listener
        bucket: String,
        /// Prefix of the new listener
        prefix: Option<String>,
        /// Attempts made
        attempts: u32,
    },
    /// A row failed validation on flush.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The topic broker rejected a call.
    #[error("topic broker {op} failed: {reason}")]
    Topic {
        /// Broker operation name
        op: &'static str,
        /// Failure details
        reason: String,
    },
    /// Reading or writing the bucket notification configuration failed.
    #[error("bucket notification config for {bucket} failed: {reason}")]
    BucketConfig {
        /// Bucket name
        bucket: String,
        /// Failure details
        reason: String,
    },
    /// Key-value store failure.
    #[error("kv store error: {0}")]
    Kv(String),
    /// Row encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The handler protocol is unknown or disabled.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    /// Bad configuration.
    #[error("config error: {0}")]
    Config(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for failures that a fresh attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Constraint(_)
                | EngineError::Topic { .. }
                | EngineError::BucketConfig { .. }
        )
    }

    pub(crate) fn topic(op: &'static str, reason: impl ToString) -> Self {
        EngineError::Topic {
            op,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn bucket_config(bucket: &str, reason: impl ToString) -> Self {
        EngineError::BucketConfig {
            bucket: bucket.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias using EngineError as the error type.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_notifications_message() {
        let err = EngineError::OverlappingNotifications {
            bucket: "b".to_string(),
            prefix: Some("a/".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "found overlapping active notifications covering s3://b/a/"
        );
    }

    #[test]
    fn test_exhausted_message_whole_bucket() {
        let err = EngineError::ConsolidationExhausted {
            bucket: "b".to_string(),
            prefix: None,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "unable to retrieve covering notification for s3://b/ after 3 attempts"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::topic("create_topic", "throttled").is_retryable());
        assert!(EngineError::bucket_config("b", "denied").is_retryable());
        assert!(!EngineError::ListenerNotFound(ListenerId::from("x")).is_retryable());
        assert!(!EngineError::OverlappingNotifications {
            bucket: "b".to_string(),
            prefix: None
        }
        .is_retryable());
    }
}
