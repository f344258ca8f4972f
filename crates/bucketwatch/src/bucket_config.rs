//! Bucket notification configuration documents and scoped read-modify-write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::covers;

/// A single `FilterRules` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterRule {
    /// Rule kind, `prefix` for the rules written here.
    pub name: String,
    /// Rule argument.
    pub value: String,
}

/// Object key filter of a configuration entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyFilter {
    /// Rules an object key must satisfy.
    pub filter_rules: Vec<FilterRule>,
}

/// `Filter` block of a configuration entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigFilter {
    /// Object key filter.
    pub key: KeyFilter,
}

/// One topic entry of the bucket notification configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopicConfiguration {
    /// Entry id, unique within the bucket.
    pub id: String,
    /// Destination topic.
    pub topic_arn: String,
    /// Event names routed by this entry.
    pub events: Vec<String>,
    /// Key filter; absent for whole-bucket entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ConfigFilter>,
}

impl TopicConfiguration {
    /// Entry routing `events` under `prefix` (whole bucket when `None`) to `topic_arn`.
    pub fn new(id: &str, topic_arn: &str, events: Vec<String>, prefix: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            topic_arn: topic_arn.to_string(),
            events,
            filter: prefix.map(|p| ConfigFilter {
                key: KeyFilter {
                    filter_rules: vec![FilterRule {
                        name: "prefix".to_string(),
                        value: p.to_string(),
                    }],
                },
            }),
        }
    }

    /// The prefix rule value, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.filter.as_ref().and_then(|f| {
            f.key
                .filter_rules
                .iter()
                .find(|r| r.name.eq_ignore_ascii_case("prefix"))
                .map(|r| r.value.as_str())
        })
    }
}

/// The whole notification configuration of a bucket.
///
/// Queue and function entries are carried opaquely so writes never drop them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationConfiguration {
    /// Topic entries, the only kind this crate edits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_configurations: Vec<TopicConfiguration>,
    /// Queue entries, kept as read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queue_configurations: Vec<serde_json::Value>,
    /// Lambda function entries, kept as read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lambda_function_configurations: Vec<serde_json::Value>,
}

/// Remote access to a bucket's notification configuration.
#[async_trait]
pub trait BucketConfigClient: Send + Sync {
    /// Fetches the full configuration document.
    async fn get_notification_configuration(&self, bucket: &str) -> Result<NotificationConfiguration>;

    /// Replaces the full configuration document.
    async fn put_notification_configuration(
        &self,
        bucket: &str,
        config: NotificationConfiguration,
    ) -> Result<()>;
}

/// Mutable view of a bucket's topic entries, keyed by config id.
#[derive(Debug, Default)]
pub struct TopicConfigs {
    entries: Vec<TopicConfiguration>,
}

impl TopicConfigs {
    /// Adds an entry. The id must not already be present.
    pub fn insert(&mut self, config: TopicConfiguration) -> Result<()> {
        if self.contains(&config.id) {
            return Err(EngineError::DuplicateConfigId(config.id));
        }
        self.entries.push(config);
        Ok(())
    }

    /// Removes the entry with `id`, returning it.
    pub fn remove(&mut self, id: &str) -> Option<TopicConfiguration> {
        let pos = self.entries.iter().position(|c| c.id == id);
        match pos {
            Some(pos) => Some(self.entries.remove(pos)),
            None => {
                warn!("Topic notification config {} not present", id);
                None
            }
        }
    }

    /// Entry with `id`.
    pub fn get(&self, id: &str) -> Option<&TopicConfiguration> {
        self.entries.iter().find(|c| c.id == id)
    }

    /// True if an entry with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Number of topic entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no topic entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Swaps every managed entry inside `scope` for `added`.
    ///
    /// Managed entries are those whose id starts with `id_prefix`. Any of them
    /// filtering at or under `scope` is removed, whether or not it is listed in
    /// `expected`; unlisted ones are stale leftovers and get a warning. Returns
    /// the removed entries.
    pub fn replace_managed(
        &mut self,
        id_prefix: &str,
        scope: Option<&str>,
        expected: &[String],
        added: Vec<TopicConfiguration>,
    ) -> Result<Vec<TopicConfiguration>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|c| c.id.starts_with(id_prefix) && covers(scope, c.prefix()));
        self.entries = kept;

        for stale in removed.iter().filter(|c| !expected.contains(&c.id)) {
            warn!(
                "Removing stale topic notification config {} on {}",
                stale.id, stale.topic_arn
            );
        }
        for id in expected {
            if !removed.iter().any(|c| &c.id == id) {
                warn!("Topic notification config {} not present", id);
            }
        }
        for config in added {
            self.insert(config)?;
        }
        Ok(removed)
    }

    /// Undoes [`TopicConfigs::replace_managed`]: drops the added ids and puts
    /// back the removed entries.
    pub fn restore(&mut self, added_ids: &[String], removed: Vec<TopicConfiguration>) -> Result<()> {
        for id in added_ids {
            self.remove(id);
        }
        for config in removed {
            if !self.contains(&config.id) {
                self.insert(config)?;
            }
        }
        Ok(())
    }
}

/// Scoped read-modify-write over a [`BucketConfigClient`].
#[derive(Clone)]
pub struct BucketConfigAdapter {
    client: Arc<dyn BucketConfigClient>,
}

impl BucketConfigAdapter {
    /// Wraps a client.
    pub fn new(client: Arc<dyn BucketConfigClient>) -> Self {
        Self { client }
    }

    /// Fetches the bucket's configuration, lets `mutate` edit the topic entries
    /// and writes the whole document back in one call.
    ///
    /// Nothing is written if `mutate` fails. Returns what `mutate` returned.
    pub async fn update_topic_configs<F, T>(&self, bucket: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut TopicConfigs) -> Result<T> + Send,
        T: Send,
    {
        let mut document = self.client.get_notification_configuration(bucket).await?;
        debug!(
            "Retrieved notification configs for {}: {} topic, {} queue, {} lambda",
            bucket,
            document.topic_configurations.len(),
            document.queue_configurations.len(),
            document.lambda_function_configurations.len()
        );

        let mut topics = TopicConfigs {
            entries: std::mem::take(&mut document.topic_configurations),
        };
        let outcome = mutate(&mut topics)?;
        document.topic_configurations = topics.entries;

        debug!(
            "Putting {} topic notification configs on {}",
            document.topic_configurations.len(),
            bucket
        );
        self.client.put_notification_configuration(bucket, document).await?;
        Ok(outcome)
    }
}

/// In-memory bucket configuration service with fault injection.
#[derive(Default)]
pub struct MemoryBucketConfigClient {
    documents: Mutex<HashMap<String, NotificationConfiguration>>,
    failing_gets: AtomicU32,
    failing_puts: AtomicU32,
    puts: AtomicU64,
}

impl MemoryBucketConfigClient {
    /// A client with no documents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` reads fail.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Seeds or replaces a bucket's document.
    pub fn set_document(&self, bucket: &str, config: NotificationConfiguration) -> Result<()> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|e| EngineError::bucket_config(bucket, e))?;
        docs.insert(bucket.to_string(), config);
        Ok(())
    }

    /// Current document of a bucket.
    pub fn document(&self, bucket: &str) -> Result<NotificationConfiguration> {
        let docs = self
            .documents
            .lock()
            .map_err(|e| EngineError::bucket_config(bucket, e))?;
        Ok(docs.get(bucket).cloned().unwrap_or_default())
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BucketConfigClient for MemoryBucketConfigClient {
    async fn get_notification_configuration(&self, bucket: &str) -> Result<NotificationConfiguration> {
        if take_fault(&self.failing_gets) {
            return Err(EngineError::bucket_config(bucket, "injected read failure"));
        }
        self.document(bucket)
    }

    async fn put_notification_configuration(
        &self,
        bucket: &str,
        config: NotificationConfiguration,
    ) -> Result<()> {
        if take_fault(&self.failing_puts) {
            return Err(EngineError::bucket_config(bucket, "injected write failure"));
        }
        self.set_document(bucket, config)?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> Vec<String> {
        vec!["s3:ObjectCreated:*".to_string()]
    }

    #[test]
    fn test_topic_configuration_wire_shape() {
        let cfg = TopicConfiguration::new("iris-1", "arn:aws:sns:us-east-1:1:iris-1", events(), Some("a/"));
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["Id"], "iris-1");
        assert_eq!(json["TopicArn"], "arn:aws:sns:us-east-1:1:iris-1");
        assert_eq!(json["Events"][0], "s3:ObjectCreated:*");
        assert_eq!(json["Filter"]["Key"]["FilterRules"][0]["Name"], "prefix");
        assert_eq!(json["Filter"]["Key"]["FilterRules"][0]["Value"], "a/");

        let whole = TopicConfiguration::new("iris-2", "arn", events(), None);
        let json = serde_json::to_value(&whole).unwrap();
        assert!(json.get("Filter").is_none());
    }

    #[test]
    fn test_topic_configs_insert_and_remove() {
        let mut configs = TopicConfigs::default();
        configs
            .insert(TopicConfiguration::new("a", "arn", events(), None))
            .unwrap();
        assert!(matches!(
            configs.insert(TopicConfiguration::new("a", "arn", events(), None)),
            Err(EngineError::DuplicateConfigId(_))
        ));
        assert!(configs.remove("missing").is_none());
        assert!(configs.remove("a").is_some());
        assert!(configs.is_empty());
    }

    #[tokio::test]
    async fn test_update_preserves_other_configuration_kinds() {
        let client = Arc::new(MemoryBucketConfigClient::new());
        client
            .set_document(
                "b",
                NotificationConfiguration {
                    topic_configurations: vec![TopicConfiguration::new("old", "arn:old", events(), None)],
                    queue_configurations: vec![serde_json::json!({"Id": "q", "QueueArn": "arn:q"})],
                    lambda_function_configurations: vec![],
                },
            )
            .unwrap();
        let adapter = BucketConfigAdapter::new(client.clone());

        adapter
            .update_topic_configs("b", |configs| {
                configs.remove("old");
                configs.insert(TopicConfiguration::new("new", "arn:new", events(), Some("x/")))
            })
            .await
            .unwrap();

        let doc = client.document("b").unwrap();
        assert_eq!(doc.topic_configurations.len(), 1);
        assert_eq!(doc.topic_configurations[0].id, "new");
        assert_eq!(doc.queue_configurations.len(), 1);
        assert_eq!(client.put_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let client = Arc::new(MemoryBucketConfigClient::new());
        let adapter = BucketConfigAdapter::new(client.clone());

        let result: Result<()> = adapter
            .update_topic_configs("b", |configs| {
                configs.insert(TopicConfiguration::new("x", "arn", events(), None))?;
                Err(EngineError::DuplicateConfigId("x".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(client.put_count(), 0);
        assert!(client.document("b").unwrap().topic_configurations.is_empty());
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let client = Arc::new(MemoryBucketConfigClient::new());
        client.fail_next_puts(1);
        let adapter = BucketConfigAdapter::new(client.clone());

        let first = adapter.update_topic_configs("b", |_| Ok(())).await;
        assert!(matches!(first, Err(EngineError::BucketConfig { .. })));
        adapter.update_topic_configs("b", |_| Ok(())).await.unwrap();
        assert_eq!(client.put_count(), 1);
    }

    #[test]
    fn test_document_parses_s3_json() {
        let raw = r#"{
            "TopicConfigurations": [{
                "Id": "iris-1",
                "TopicArn": "arn:aws:sns:us-east-1:1:iris-1",
                "Events": ["s3:ObjectCreated:*"],
                "Filter": {"Key": {"FilterRules": [{"Name": "Prefix", "Value": "logs/"}]}}
            }],
            "LambdaFunctionConfigurations": [{"Id": "fn"}]
        }"#;
        let doc: NotificationConfiguration = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.topic_configurations[0].prefix(), Some("logs/"));
        assert_eq!(doc.lambda_function_configurations.len(), 1);
        assert!(doc.queue_configurations.is_empty());
    }

    #[test]
    fn test_replace_managed_sweeps_scope() {
        let mut configs = TopicConfigs::default();
        for (id, prefix) in [
            ("iris-n1", Some("a/b/")),
            ("iris-stale", Some("a/c/")),
            ("iris-n2", Some("x/")),
            ("custom", Some("a/d/")),
        ] {
            configs
                .insert(TopicConfiguration::new(id, "arn", events(), prefix))
                .unwrap();
        }

        let removed = configs
            .replace_managed(
                "iris-",
                Some("a/"),
                &["iris-n1".to_string()],
                vec![TopicConfiguration::new("iris-n3", "arn", events(), Some("a/"))],
            )
            .unwrap();

        let mut removed_ids: Vec<_> = removed.iter().map(|c| c.id.as_str()).collect();
        removed_ids.sort();
        assert_eq!(removed_ids, vec!["iris-n1", "iris-stale"]);
        assert!(configs.contains("iris-n2"));
        assert!(configs.contains("custom"));
        assert!(configs.contains("iris-n3"));
        assert_eq!(configs.len(), 3);

        configs.restore(&["iris-n3".to_string()], removed).unwrap();
        assert!(configs.contains("iris-n1"));
        assert!(configs.contains("iris-stale"));
        assert!(!configs.contains("iris-n3"));
        assert_eq!(configs.len(), 4);
    }

    #[test]
    fn test_replace_managed_whole_bucket_scope() {
        let mut configs = TopicConfigs::default();
        configs
            .insert(TopicConfiguration::new("iris-n1", "arn", events(), None))
            .unwrap();
        configs
            .insert(TopicConfiguration::new("iris-n2", "arn", events(), Some("a/")))
            .unwrap();
        let removed = configs.replace_managed("iris-", None, &[], Vec::new()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(configs.is_empty());
    }
}
