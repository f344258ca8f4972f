//! Persistent rows: handlers, listeners and notifications.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bucket_config::TopicConfiguration;
use crate::protocol::Protocol;
use crate::store::Record;
use crate::types::{HandlerId, ListenerId, ListenerState, NotificationId, NotificationState};

/// A deduplicated delivery target. Identity is the (protocol, endpoint) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    /// Row id.
    pub id: HandlerId,
    /// Transport used to deliver events.
    pub protocol: Protocol,
    /// Transport-specific destination, e.g. a queue ARN or URL.
    pub endpoint: String,
}

impl Handler {
    /// A handler with a fresh id.
    pub fn new(protocol: Protocol, endpoint: &str) -> Self {
        Self {
            id: HandlerId::generate(),
            protocol,
            endpoint: endpoint.to_string(),
        }
    }
}

impl Record for Handler {
    const TABLE: &'static str = "handler";
    type Id = HandlerId;

    fn id(&self) -> &HandlerId {
        &self.id
    }
}

/// One client registration of interest in a bucket path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    /// Row id.
    pub id: ListenerId,
    /// Lifecycle state.
    pub state: ListenerState,
    /// Free-form client label.
    pub tag: Option<String>,
    /// Watched bucket.
    pub bucket: String,
    /// `None` watches the whole bucket.
    pub prefix: Option<String>,
    /// Owning notification; re-pointed by consolidation and splitting.
    pub notification_id: NotificationId,
    /// Delivery target.
    pub handler_id: HandlerId,
}

impl Listener {
    /// A new active listener.
    pub fn new(
        bucket: &str,
        prefix: Option<&str>,
        tag: Option<&str>,
        notification_id: NotificationId,
        handler_id: HandlerId,
    ) -> Self {
        Self {
            id: ListenerId::generate(),
            state: ListenerState::Active,
            tag: tag.map(str::to_string),
            bucket: bucket.to_string(),
            prefix: prefix.map(str::to_string),
            notification_id,
            handler_id,
        }
    }

    /// True while the listener has not been removed.
    pub fn is_active(&self) -> bool {
        self.state == ListenerState::Active
    }
}

impl Record for Listener {
    const TABLE: &'static str = "listener";
    type Id = ListenerId;

    fn id(&self) -> &ListenerId {
        &self.id
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }
}

/// One entry of a bucket's notification configuration, backed by one topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Row id; also names the topic.
    pub id: NotificationId,
    /// Lifecycle state.
    pub state: NotificationState,
    /// Bucket whose events this notification routes.
    pub bucket: String,
    /// Scope of the notification; `None` is the whole bucket.
    pub prefix: Option<String>,
    /// Key of this notification's entry in the remote bucket configuration.
    pub topic_config_id: String,
    /// Topic receiving the bucket's events.
    pub topic_arn: String,
    /// Handler id -> subscription reference on `topic_arn`.
    pub topic_subscriptions: BTreeMap<HandlerId, String>,
    /// Set when CONSOLIDATED: the broader notification that replaced this one.
    pub consolidated_by: Option<NotificationId>,
    /// Set when DEACTIVATED: the narrower notifications that replaced this one.
    pub unconsolidated: Vec<NotificationId>,
}

impl Notification {
    /// A new active notification. `id` is chosen by the caller so the topic
    /// can be named after it before the row exists.
    pub fn new(
        id: NotificationId,
        bucket: &str,
        prefix: Option<&str>,
        topic_config_id: String,
        topic_arn: String,
    ) -> Self {
        Self {
            id,
            state: NotificationState::Active,
            bucket: bucket.to_string(),
            prefix: prefix.map(str::to_string),
            topic_config_id,
            topic_arn,
            topic_subscriptions: BTreeMap::new(),
            consolidated_by: None,
            unconsolidated: Vec::new(),
        }
    }

    /// True while the notification backs a live configuration entry.
    pub fn is_active(&self) -> bool {
        self.state == NotificationState::Active
    }

    /// True if `listener` requires exactly this notification's scope.
    pub fn is_direct(&self, listener: &Listener) -> bool {
        listener.prefix == self.prefix
    }

    /// Renders the bucket configuration entry routing events to this topic.
    pub fn topic_configuration(&self, events: &[String]) -> TopicConfiguration {
        TopicConfiguration::new(
            &self.topic_config_id,
            &self.topic_arn,
            events.to_vec(),
            self.prefix.as_deref(),
        )
    }
}

impl Record for Notification {
    const TABLE: &'static str = "notification";
    type Id = NotificationId;

    fn id(&self) -> &NotificationId {
        &self.id
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }
}
