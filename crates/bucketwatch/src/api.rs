//! Request and response documents for the outer transport layer.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::split::RemovalOutcome;
use crate::types::{ListenerId, NotificationId};

/// Asks for events under a bucket path to be delivered to an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddListenerRequest {
    /// Bucket to watch.
    pub bucket: String,
    /// Omitted or null to watch the whole bucket.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Delivery protocol name, e.g. `sqs`.
    pub protocol: String,
    /// Destination in the protocol's format.
    pub endpoint: String,
    /// Free-form client label.
    #[serde(default)]
    pub tag: Option<String>,
}

impl AddListenerRequest {
    /// Rejects malformed paths, endpoints and empty protocol names.
    pub fn validate(&self) -> Result<()> {
        validate_target(&self.bucket, self.prefix.as_deref(), &self.endpoint)?;
        if self.protocol.is_empty() {
            return Err(EngineError::InvalidRequest("protocol must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Reply to [`AddListenerRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddListenerResponse {
    /// Id of the new listener.
    pub listener_id: ListenerId,
}

/// Asks for a listener to be removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveListenerRequest {
    /// Listener to remove.
    pub id: ListenerId,
}

/// Reply to [`RemoveListenerRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveListenerResponse {
    /// True if the listener's notification was deactivated.
    pub deactivated_notification: bool,
    /// Replacement notifications, when deactivated.
    pub unconsolidated_notifications: Option<Vec<NotificationId>>,
}

impl From<RemovalOutcome> for RemoveListenerResponse {
    fn from(outcome: RemovalOutcome) -> Self {
        Self {
            deactivated_notification: outcome.notification_deactivated,
            unconsolidated_notifications: outcome.replacement_notification_ids,
        }
    }
}

/// Checks the bucket path and endpoint of a listener.
pub fn validate_target(bucket: &str, prefix: Option<&str>, endpoint: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(EngineError::InvalidRequest("bucket must not be empty".to_string()));
    }
    if bucket.contains('/') || bucket.chars().any(char::is_whitespace) {
        return Err(EngineError::InvalidRequest(format!("invalid bucket name: {:?}", bucket)));
    }
    if prefix == Some("") {
        return Err(EngineError::InvalidRequest(
            "prefix must not be empty; omit it to watch the whole bucket".to_string(),
        ));
    }
    if endpoint.is_empty() {
        return Err(EngineError::InvalidRequest("endpoint must not be empty".to_string()));
    }
    Ok(())
}
