//! Notification engine: entry points for adding and removing listeners.
//!
//! Every call runs as one unit of work against the store, serialized per
//! bucket, committed on success and rolled back on any error.

use std::sync::Arc;
use tracing::error;

use crate::api::{self, AddListenerRequest, AddListenerResponse, RemoveListenerRequest, RemoveListenerResponse};
use crate::bucket_config::{BucketConfigAdapter, BucketConfigClient};
use crate::config::EngineConfig;
use crate::coverage;
use crate::entity::{Listener, Notification};
use crate::error::{EngineError, Result};
use crate::kvstore::KvStore;
use crate::lock::BucketLocks;
use crate::protocol::ProtocolRegistry;
use crate::saga::Saga;
use crate::split::RemovalOutcome;
use crate::store::{Store, Transaction};
use crate::topic::{TopicAdapter, TopicBroker};
use crate::types::{ListenerId, NotificationId};

/// Remote work settled once the local commit outcome is known.
#[derive(Debug, Default)]
pub(crate) struct Followups {
    /// Undone if the commit fails.
    pub(crate) saga: Option<Saga>,
    /// Topics of retired notifications, deleted after a successful commit
    /// when `delete_retired_topics` is set.
    pub(crate) retired_topics: Vec<String>,
}

/// Maintains consolidated notifications and the listeners bound to them.
pub struct NotificationEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) topics: TopicAdapter,
    pub(crate) bucket_configs: BucketConfigAdapter,
    pub(crate) protocols: ProtocolRegistry,
    pub(crate) locks: BucketLocks,
    pub(crate) config: EngineConfig,
}

impl NotificationEngine {
    /// Builds an engine over the given store and remote clients.
    ///
    /// Fails with `Config` if the configuration does not validate.
    pub fn new(
        config: EngineConfig,
        kv: Arc<dyn KvStore>,
        broker: Arc<dyn TopicBroker>,
        bucket_client: Arc<dyn BucketConfigClient>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Store::new(kv),
            topics: TopicAdapter::new(broker, &config.topic_prefix, &config.source_arn_partition),
            bucket_configs: BucketConfigAdapter::new(bucket_client),
            protocols: config.protocol_registry(),
            locks: BucketLocks::new(),
            config,
        })
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers a listener on `bucket`/`prefix` delivering to `endpoint`.
    ///
    /// Not idempotent: repeating the call creates another listener, reusing the
    /// handler.
    pub async fn add_listener(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        protocol: &str,
        endpoint: &str,
        tag: Option<&str>,
    ) -> Result<ListenerId> {
        api::validate_target(bucket, prefix, endpoint)?;
        let protocol = self.protocols.resolve(protocol, endpoint)?;

        // handlers are shared across buckets and committed on their own
        let handler = self.store.get_or_create_handler(protocol, endpoint)?;

        let _guard = self.locks.lock(bucket).await;
        let mut txn = self.store.begin();
        let result = self.add_listener_in(&mut txn, bucket, prefix, &handler, tag).await;
        self.settle(txn, result).await
    }

    /// Deactivates a listener, splitting its notification if nothing else
    /// needs that exact scope.
    pub async fn remove_listener(&self, id: &ListenerId) -> Result<RemovalOutcome> {
        let bucket = self
            .store
            .get::<Listener>(id)?
            .ok_or_else(|| EngineError::ListenerNotFound(id.clone()))?
            .bucket;

        let _guard = self.locks.lock(&bucket).await;
        let mut txn = self.store.begin();
        let result = self.remove_listener_in(&mut txn, id).await;
        self.settle(txn, result).await
    }

    /// Serves an AddListener request document.
    pub async fn handle_add_listener(&self, request: AddListenerRequest) -> Result<AddListenerResponse> {
        request.validate()?;
        let listener_id = self
            .add_listener(
                &request.bucket,
                request.prefix.as_deref(),
                &request.protocol,
                &request.endpoint,
                request.tag.as_deref(),
            )
            .await?;
        Ok(AddListenerResponse { listener_id })
    }

    /// Serves a RemoveListener request document.
    pub async fn handle_remove_listener(
        &self,
        request: RemoveListenerRequest,
    ) -> Result<RemoveListenerResponse> {
        Ok(self.remove_listener(&request.id).await?.into())
    }

    /// Committed listener with `id`, active or not.
    pub fn get_listener(&self, id: &ListenerId) -> Result<Option<Listener>> {
        self.store.get(id)
    }

    /// Committed notification with `id`, in any state.
    pub fn get_notification(&self, id: &NotificationId) -> Result<Option<Notification>> {
        self.store.get(id)
    }

    /// Committed active notifications of a bucket.
    pub fn active_notifications(&self, bucket: &str) -> Result<Vec<Notification>> {
        coverage::active_notifications(&self.store.begin(), bucket)
    }

    /// True if some active listener nested under `prefix` delivers to `endpoint`.
    pub fn is_endpoint_listening(&self, bucket: &str, prefix: Option<&str>, endpoint: &str) -> Result<bool> {
        coverage::exists_endpoint_listening(&self.store.begin(), bucket, prefix, endpoint)
    }

    async fn settle<T>(&self, mut txn: Transaction, result: Result<(T, Followups)>) -> Result<T> {
        let (value, followups) = match result {
            Ok(done) => done,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };

        if let Err(e) = txn.commit() {
            error!("Failed to commit: {}", e);
            if let Some(saga) = followups.saga {
                saga.compensate(&self.topics, &self.bucket_configs).await;
            }
            return Err(e);
        }

        if let Some(saga) = followups.saga {
            saga.complete();
        }
        if self.config.delete_retired_topics {
            for topic_arn in &followups.retired_topics {
                self.topics.delete_topic_quietly(topic_arn).await;
            }
        }
        Ok(value)
    }
}
