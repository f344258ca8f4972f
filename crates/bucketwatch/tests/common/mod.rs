#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

use bucketwatch::bucket_config::{BucketConfigClient, MemoryBucketConfigClient, NotificationConfiguration};
use bucketwatch::config::EngineConfig;
use bucketwatch::kvstore::MemoryKvStore;
use bucketwatch::topic::MemoryTopicBroker;
use bucketwatch::{NotificationEngine, Result};

pub const BUCKET: &str = "photos";

pub struct Harness {
    pub engine: NotificationEngine,
    pub broker: Arc<MemoryTopicBroker>,
    pub buckets: Arc<MemoryBucketConfigClient>,
    pub kv: Arc<MemoryKvStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let buckets = Arc::new(MemoryBucketConfigClient::new());
        Self::build(config, buckets.clone(), buckets)
    }

    /// Harness whose first `parties` config writes wait for each other.
    pub fn with_held_puts(parties: u32) -> Self {
        let buckets = Arc::new(MemoryBucketConfigClient::new());
        let held = Arc::new(HeldPuts::new(buckets.clone(), parties));
        Self::build(EngineConfig::default(), buckets, held)
    }

    fn build(
        config: EngineConfig,
        buckets: Arc<MemoryBucketConfigClient>,
        client: Arc<dyn BucketConfigClient>,
    ) -> Self {
        let broker = Arc::new(MemoryTopicBroker::new());
        let kv = Arc::new(MemoryKvStore::new());
        let engine = NotificationEngine::new(config, kv.clone(), broker.clone(), client)
            .expect("engine config is valid");
        Self {
            engine,
            broker,
            buckets,
            kv,
        }
    }

    /// Config ids currently present in the bucket's notification document.
    pub fn bucket_config_ids(&self, bucket: &str) -> BTreeSet<String> {
        self.buckets
            .document(bucket)
            .unwrap()
            .topic_configurations
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    /// Config ids of the committed active notifications.
    pub fn active_config_ids(&self, bucket: &str) -> BTreeSet<String> {
        self.engine
            .active_notifications(bucket)
            .unwrap()
            .into_iter()
            .map(|n| n.topic_config_id)
            .collect()
    }
}

pub fn queue(name: &str) -> String {
    format!("arn:aws:sqs:us-east-1:123456789012:{}", name)
}

/// Bucket config client whose first writes block until all of them arrive,
/// so operations on different buckets are mid-flight at the same time.
pub struct HeldPuts {
    inner: Arc<MemoryBucketConfigClient>,
    barrier: Barrier,
    remaining: AtomicU32,
}

impl HeldPuts {
    pub fn new(inner: Arc<MemoryBucketConfigClient>, parties: u32) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties as usize),
            remaining: AtomicU32::new(parties),
        }
    }
}

#[async_trait]
impl BucketConfigClient for HeldPuts {
    async fn get_notification_configuration(&self, bucket: &str) -> Result<NotificationConfiguration> {
        self.inner.get_notification_configuration(bucket).await
    }

    async fn put_notification_configuration(
        &self,
        bucket: &str,
        config: NotificationConfiguration,
    ) -> Result<()> {
        let held = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if held {
            self.barrier.wait().await;
        }
        self.inner.put_notification_configuration(bucket, config).await
    }
}
