//! Pub/sub topics backing notifications, and handler subscriptions to them.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::entity::{Handler, Notification};
use crate::error::{EngineError, Result};
use crate::protocol::Protocol;
use crate::types::{HandlerId, NotificationId};

/// Remote pub/sub broker.
#[async_trait]
pub trait TopicBroker: Send + Sync {
    /// Creates (or returns the existing) topic named `name`, returning its ARN.
    async fn create_topic(&self, name: &str) -> Result<String>;

    /// Replaces the topic's access policy document.
    async fn set_topic_policy(&self, topic_arn: &str, policy: &str) -> Result<()>;

    /// Deletes a topic and all its subscriptions.
    async fn delete_topic(&self, topic_arn: &str) -> Result<()>;

    /// Subscribes an endpoint, returning the subscription reference.
    async fn subscribe(&self, topic_arn: &str, protocol: Protocol, endpoint: &str) -> Result<String>;

    /// Removes a subscription.
    async fn unsubscribe(&self, subscription_ref: &str) -> Result<()>;
}

/// Policy allowing only one bucket to publish to a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Topic the policy is attached to.
    pub topic_arn: String,
    /// ARN pattern of the only allowed publisher.
    pub source_arn: String,
}

impl PublishPolicy {
    /// Policy for events originating from `bucket`.
    pub fn for_bucket(topic_arn: &str, partition: &str, bucket: &str) -> Self {
        Self {
            topic_arn: topic_arn.to_string(),
            source_arn: format!("arn:{}:s3:*:*:{}", partition, bucket),
        }
    }

    /// The policy as a JSON document.
    pub fn to_document(&self) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Id": "allow-s3-notifications",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": "*"},
                "Action": ["SNS:Publish"],
                "Resource": self.topic_arn,
                "Condition": {
                    "ArnLike": {"aws:SourceArn": self.source_arn},
                },
            }],
        })
    }
}

/// Topic operations in terms of notifications and handlers.
#[derive(Clone)]
pub struct TopicAdapter {
    broker: Arc<dyn TopicBroker>,
    topic_prefix: String,
    partition: String,
}

impl TopicAdapter {
    /// Adapter naming topics `<topic_prefix><notification id>`.
    pub fn new(broker: Arc<dyn TopicBroker>, topic_prefix: &str, partition: &str) -> Self {
        Self {
            broker,
            topic_prefix: topic_prefix.to_string(),
            partition: partition.to_string(),
        }
    }

    /// Topic name and bucket config id of a notification.
    pub fn topic_name(&self, id: &NotificationId) -> String {
        format!("{}{}", self.topic_prefix, id)
    }

    /// Creates the topic for a new notification and restricts publishing to `bucket`.
    pub async fn create_notification_topic(&self, id: &NotificationId, bucket: &str) -> Result<String> {
        let topic_arn = self.broker.create_topic(&self.topic_name(id)).await?;
        if let Err(e) = self.set_publish_policy(&topic_arn, bucket).await {
            self.delete_topic_quietly(&topic_arn).await;
            return Err(e);
        }
        Ok(topic_arn)
    }

    /// Allows only `bucket` to publish to the topic.
    pub async fn set_publish_policy(&self, topic_arn: &str, bucket: &str) -> Result<()> {
        let policy = PublishPolicy::for_bucket(topic_arn, &self.partition, bucket);
        self.broker
            .set_topic_policy(topic_arn, &policy.to_document().to_string())
            .await
    }

    /// Deletes a topic and its subscriptions.
    pub async fn delete_topic(&self, topic_arn: &str) -> Result<()> {
        info!("Deleting topic {}", topic_arn);
        self.broker.delete_topic(topic_arn).await
    }

    /// Deletes a topic, logging instead of failing.
    pub async fn delete_topic_quietly(&self, topic_arn: &str) {
        if let Err(e) = self.delete_topic(topic_arn).await {
            warn!("Failed to delete topic {}: {}", topic_arn, e);
        }
    }

    /// Subscribes `handler` to the notification's topic and records the reference.
    pub async fn subscribe_handler(&self, nfn: &mut Notification, handler: &Handler) -> Result<String> {
        info!(
            "Subscribing to {} with {} protocol: {}",
            nfn.topic_arn, handler.protocol, handler.endpoint
        );
        let sub_ref = self
            .broker
            .subscribe(&nfn.topic_arn, handler.protocol, &handler.endpoint)
            .await?;
        nfn.topic_subscriptions
            .insert(handler.id.clone(), sub_ref.clone());
        Ok(sub_ref)
    }

    /// Removes the handler's subscription from the notification's topic.
    ///
    /// Returns false if no subscription was recorded for the handler.
    pub async fn unsubscribe_handler(&self, nfn: &mut Notification, handler_id: &HandlerId) -> Result<bool> {
        let Some(sub_ref) = nfn.topic_subscriptions.remove(handler_id) else {
            warn!(
                "No subscription recorded for handler {} on {}",
                handler_id, nfn.topic_arn
            );
            return Ok(false);
        };
        info!("Unsubscribing handler {} from {}", handler_id, nfn.topic_arn);
        self.unsubscribe(&sub_ref).await?;
        Ok(true)
    }

    /// Removes a subscription by reference.
    pub async fn unsubscribe(&self, subscription_ref: &str) -> Result<()> {
        self.broker.unsubscribe(subscription_ref).await
    }
}

/// Broker call kinds, for fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    /// [`TopicBroker::create_topic`]
    CreateTopic,
    /// [`TopicBroker::set_topic_policy`]
    SetTopicPolicy,
    /// [`TopicBroker::delete_topic`]
    DeleteTopic,
    /// [`TopicBroker::subscribe`]
    Subscribe,
    /// [`TopicBroker::unsubscribe`]
    Unsubscribe,
}

impl BrokerOp {
    fn name(&self) -> &'static str {
        match self {
            BrokerOp::CreateTopic => "create_topic",
            BrokerOp::SetTopicPolicy => "set_topic_policy",
            BrokerOp::DeleteTopic => "delete_topic",
            BrokerOp::Subscribe => "subscribe",
            BrokerOp::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Clone, Debug, Default)]
struct TopicState {
    policy: Option<String>,
    // subscription ref -> (protocol, endpoint)
    subscriptions: BTreeMap<String, (Protocol, String)>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicState>,
    faults: HashMap<BrokerOp, Fault>,
    next_subscription: u64,
    deleted: u64,
}

#[derive(Clone, Copy, Default)]
struct Fault {
    skip: u32,
    fail: u32,
}

/// In-memory topic broker with fault injection.
#[derive(Default)]
pub struct MemoryTopicBroker {
    state: Mutex<BrokerState>,
}

impl MemoryTopicBroker {
    /// A broker with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|e| EngineError::topic("lock", e))
    }

    fn check_fault(state: &mut BrokerState, op: BrokerOp) -> Result<()> {
        if let Some(fault) = state.faults.get_mut(&op) {
            if fault.skip > 0 {
                fault.skip -= 1;
            } else if fault.fail > 0 {
                fault.fail -= 1;
                return Err(EngineError::topic(op.name(), "injected failure"));
            }
        }
        Ok(())
    }

    /// Makes the next `n` calls of `op` fail.
    pub fn fail_next(&self, op: BrokerOp, n: u32) {
        self.fail_after(op, 0, n);
    }

    /// Lets the next `skip` calls of `op` through, then fails `n` of them.
    pub fn fail_after(&self, op: BrokerOp, skip: u32, n: u32) {
        if let Ok(mut state) = self.state() {
            state.faults.insert(op, Fault { skip, fail: n });
        }
    }

    /// ARNs of live topics.
    pub fn topic_arns(&self) -> Vec<String> {
        self.state()
            .map(|s| s.topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live topics.
    pub fn topic_count(&self) -> usize {
        self.state().map(|s| s.topics.len()).unwrap_or(0)
    }

    /// Number of topics deleted so far.
    pub fn deleted_count(&self) -> u64 {
        self.state().map(|s| s.deleted).unwrap_or(0)
    }

    /// Endpoints subscribed to a topic.
    pub fn subscribed_endpoints(&self, topic_arn: &str) -> Vec<String> {
        self.state()
            .ok()
            .and_then(|s| {
                s.topics.get(topic_arn).map(|t| {
                    t.subscriptions
                        .values()
                        .map(|(_, endpoint)| endpoint.clone())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    /// Policy document attached to a topic.
    pub fn policy(&self, topic_arn: &str) -> Option<String> {
        self.state()
            .ok()
            .and_then(|s| s.topics.get(topic_arn).and_then(|t| t.policy.clone()))
    }
}

#[async_trait]
impl TopicBroker for MemoryTopicBroker {
    async fn create_topic(&self, name: &str) -> Result<String> {
        let mut state = self.state()?;
        Self::check_fault(&mut state, BrokerOp::CreateTopic)?;
        let arn = format!("arn:aws:sns:us-east-1:000000000000:{}", name);
        state.topics.entry(arn.clone()).or_default();
        Ok(arn)
    }

    async fn set_topic_policy(&self, topic_arn: &str, policy: &str) -> Result<()> {
        let mut state = self.state()?;
        Self::check_fault(&mut state, BrokerOp::SetTopicPolicy)?;
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| EngineError::topic("set_topic_policy", format!("no topic {}", topic_arn)))?;
        topic.policy = Some(policy.to_string());
        Ok(())
    }

    async fn delete_topic(&self, topic_arn: &str) -> Result<()> {
        let mut state = self.state()?;
        Self::check_fault(&mut state, BrokerOp::DeleteTopic)?;
        if state.topics.remove(topic_arn).is_some() {
            state.deleted += 1;
        }
        Ok(())
    }

    async fn subscribe(&self, topic_arn: &str, protocol: Protocol, endpoint: &str) -> Result<String> {
        let mut state = self.state()?;
        Self::check_fault(&mut state, BrokerOp::Subscribe)?;
        state.next_subscription += 1;
        let sub_ref = format!("{}:sub-{}", topic_arn, state.next_subscription);
        let topic = state
            .topics
            .get_mut(topic_arn)
            .ok_or_else(|| EngineError::topic("subscribe", format!("no topic {}", topic_arn)))?;
        topic
            .subscriptions
            .insert(sub_ref.clone(), (protocol, endpoint.to_string()));
        Ok(sub_ref)
    }

    async fn unsubscribe(&self, subscription_ref: &str) -> Result<()> {
        let mut state = self.state()?;
        Self::check_fault(&mut state, BrokerOp::Unsubscribe)?;
        for topic in state.topics.values_mut() {
            if topic.subscriptions.remove(subscription_ref).is_some() {
                return Ok(());
            }
        }
        Err(EngineError::topic(
            "unsubscribe",
            format!("no subscription {}", subscription_ref),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (Arc<MemoryTopicBroker>, TopicAdapter) {
        let broker = Arc::new(MemoryTopicBroker::new());
        let adapter = TopicAdapter::new(broker.clone(), "iris-", "aws");
        (broker, adapter)
    }

    #[test]
    fn test_publish_policy_document() {
        let policy = PublishPolicy::for_bucket("arn:aws:sns:us-east-1:1:t", "aws", "photos");
        let doc = policy.to_document();
        assert_eq!(doc["Statement"][0]["Action"][0], "SNS:Publish");
        assert_eq!(doc["Statement"][0]["Resource"], "arn:aws:sns:us-east-1:1:t");
        assert_eq!(
            doc["Statement"][0]["Condition"]["ArnLike"]["aws:SourceArn"],
            "arn:aws:s3:*:*:photos"
        );
    }

    #[tokio::test]
    async fn test_create_notification_topic_sets_policy() {
        let (broker, adapter) = adapter();
        let id = NotificationId::from("n1");
        let arn = adapter.create_notification_topic(&id, "photos").await.unwrap();
        assert!(arn.ends_with(":iris-n1"));
        let policy = broker.policy(&arn).unwrap();
        assert!(policy.contains("arn:aws:s3:*:*:photos"));
    }

    #[tokio::test]
    async fn test_policy_failure_deletes_new_topic() {
        let (broker, adapter) = adapter();
        broker.fail_next(BrokerOp::SetTopicPolicy, 1);
        let result = adapter
            .create_notification_topic(&NotificationId::from("n1"), "photos")
            .await;
        assert!(matches!(result, Err(EngineError::Topic { .. })));
        assert_eq!(broker.topic_count(), 0);
        assert_eq!(broker.deleted_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_after_lets_earlier_calls_through() {
        let (broker, _) = adapter();
        broker.fail_after(BrokerOp::CreateTopic, 1, 1);
        broker.create_topic("first").await.unwrap();
        assert!(broker.create_topic("second").await.is_err());
        broker.create_topic("third").await.unwrap();
        assert_eq!(broker.topic_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_handler() {
        let (broker, adapter) = adapter();
        let id = NotificationId::from("n1");
        let arn = adapter.create_notification_topic(&id, "b").await.unwrap();
        let mut nfn = Notification::new(id, "b", None, "iris-n1".to_string(), arn.clone());
        let handler = Handler::new(Protocol::Sqs, "arn:aws:sqs:us-east-1:1:q1");

        adapter.subscribe_handler(&mut nfn, &handler).await.unwrap();
        assert!(nfn.topic_subscriptions.contains_key(&handler.id));
        assert_eq!(broker.subscribed_endpoints(&arn), vec!["arn:aws:sqs:us-east-1:1:q1"]);

        assert!(adapter.unsubscribe_handler(&mut nfn, &handler.id).await.unwrap());
        assert!(nfn.topic_subscriptions.is_empty());
        assert!(broker.subscribed_endpoints(&arn).is_empty());
        assert!(!adapter.unsubscribe_handler(&mut nfn, &handler.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_topic_drops_subscriptions() {
        let (broker, adapter) = adapter();
        let arn = broker.create_topic("t").await.unwrap();
        let sub = broker
            .subscribe(&arn, Protocol::Https, "https://example.com/hook")
            .await
            .unwrap();
        adapter.delete_topic(&arn).await.unwrap();
        assert_eq!(broker.topic_count(), 0);
        assert!(broker.unsubscribe(&sub).await.is_err());
    }
}
