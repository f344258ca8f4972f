//! Adding listeners, consolidating narrower notifications into a broader one
//! when no existing notification covers the new listener.

use tracing::{error, info, warn};

use crate::coverage;
use crate::engine::{Followups, NotificationEngine};
use crate::entity::{Handler, Listener, Notification};
use crate::error::{EngineError, Result};
use crate::saga::{Compensation, Saga};
use crate::store::Transaction;
use crate::types::{display_path, ListenerId, NotificationId, NotificationState};

/// Notification a new listener binds to, with the remote work done to get it.
struct Covering {
    nfn: Notification,
    /// Topics of the notifications a consolidation retired.
    retired_topics: Vec<String>,
    /// Undoes the consolidation if the commit fails.
    saga: Saga,
}

impl NotificationEngine {
    pub(crate) async fn add_listener_in(
        &self,
        txn: &mut Transaction,
        bucket: &str,
        prefix: Option<&str>,
        handler: &Handler,
        tag: Option<&str>,
    ) -> Result<(ListenerId, Followups)> {
        let Covering {
            mut nfn,
            retired_topics,
            mut saga,
        } = self
            .resolve_covering_notification(txn, bucket, prefix, handler)
            .await?;

        // a fresh consolidation has already subscribed the handler
        if !nfn.topic_subscriptions.contains_key(&handler.id) {
            match self.topics.subscribe_handler(&mut nfn, handler).await {
                Ok(subscription_ref) => saga.record(Compensation::Unsubscribe { subscription_ref }),
                Err(e) => {
                    saga.compensate(&self.topics, &self.bucket_configs).await;
                    return Err(e);
                }
            }
        }

        let lst = Listener::new(bucket, prefix, tag, nfn.id.clone(), handler.id.clone());
        if let Err(e) = stage(txn, &nfn, &[], std::slice::from_ref(&lst)) {
            saga.compensate(&self.topics, &self.bucket_configs).await;
            return Err(e);
        }

        info!(
            "Added listener {} on {} via notification {}",
            lst.id,
            display_path(bucket, prefix),
            nfn.id
        );
        Ok((
            lst.id,
            Followups {
                saga: Some(saga),
                retired_topics,
            },
        ))
    }

    /// Returns the notification covering the path, consolidating if there is none.
    ///
    /// A failed consolidation rolls the transaction back and starts over from
    /// the coverage query.
    async fn resolve_covering_notification(
        &self,
        txn: &mut Transaction,
        bucket: &str,
        prefix: Option<&str>,
        handler: &Handler,
    ) -> Result<Covering> {
        let attempts = self.config.consolidation_attempts;
        for attempt in 1..=attempts {
            if let Some(nfn) = coverage::get_covering_notification(txn, bucket, prefix)? {
                return Ok(Covering {
                    nfn,
                    retired_topics: Vec::new(),
                    saga: Saga::new("add_listener"),
                });
            }

            match self.consolidate(txn, bucket, prefix, handler).await {
                Ok(done) => return Ok(done),
                Err(e) if e.is_retryable() => {
                    error!(
                        "Failed to consolidate notifications (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    txn.rollback();
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::ConsolidationExhausted {
            bucket: bucket.to_string(),
            prefix: prefix.map(str::to_string),
            attempts,
        })
    }

    /// Creates a notification watching the path, absorbing every notification
    /// nested under it.
    ///
    /// The new topic gets the handlers of every absorbed listener plus the
    /// handler of the listener being added. The bucket configuration then
    /// swaps every managed entry inside the path for the new one.
    async fn consolidate(
        &self,
        txn: &mut Transaction,
        bucket: &str,
        prefix: Option<&str>,
        handler: &Handler,
    ) -> Result<Covering> {
        info!("Watching path: {}", display_path(bucket, prefix));

        let mut covered = coverage::get_covered_notifications(txn, bucket, prefix)?;
        let covered_ids: Vec<NotificationId> = covered.iter().map(|n| n.id.clone()).collect();
        info!("Consolidating notifications: {:?}", covered_ids);

        let mut listeners = coverage::routed_listeners(txn, bucket, &covered_ids)?;
        let mut handlers = coverage::listener_handlers(txn, &listeners)?;
        handlers.insert(handler.id.clone(), handler.clone());

        let id = NotificationId::generate();
        let topic_arn = self.topics.create_notification_topic(&id, bucket).await?;
        let mut saga = Saga::new("consolidate");
        saga.record(Compensation::DeleteTopic {
            topic_arn: topic_arn.clone(),
        });
        let mut nfn = Notification::new(id.clone(), bucket, prefix, self.topics.topic_name(&id), topic_arn);

        for c_nfn in covered.iter_mut() {
            c_nfn.state = NotificationState::Consolidated;
            c_nfn.consolidated_by = Some(nfn.id.clone());
        }
        for lst in listeners.iter_mut() {
            lst.notification_id = nfn.id.clone();
        }
        if let Err(e) = stage(txn, &nfn, &covered, &listeners) {
            saga.compensate(&self.topics, &self.bucket_configs).await;
            return Err(e);
        }

        for member in handlers.values() {
            if let Err(e) = self.topics.subscribe_handler(&mut nfn, member).await {
                saga.compensate(&self.topics, &self.bucket_configs).await;
                return Err(e);
            }
        }
        if let Err(e) = txn.add(&nfn) {
            saga.compensate(&self.topics, &self.bucket_configs).await;
            return Err(e);
        }

        let new_config = nfn.topic_configuration(&self.config.event_names);
        let added = vec![new_config.id.clone()];
        let retired_config_ids: Vec<String> = covered.iter().map(|c| c.topic_config_id.clone()).collect();
        let id_prefix = self.config.topic_prefix.clone();
        let scope = prefix.map(str::to_string);
        let rewrite = self
            .bucket_configs
            .update_topic_configs(bucket, move |configs| {
                configs.replace_managed(&id_prefix, scope.as_deref(), &retired_config_ids, vec![new_config])
            })
            .await;
        match rewrite {
            Ok(removed) => saga.record(Compensation::RevertTopicConfigs {
                bucket: bucket.to_string(),
                added,
                removed,
            }),
            Err(e) => {
                error!("Failed to consolidate bucket notification configs for {}", bucket);
                if saga.compensate(&self.topics, &self.bucket_configs).await > 0 {
                    warn!("Topic {} of notification {} may be leaked", nfn.topic_arn, nfn.id);
                }
                return Err(e);
            }
        }

        Ok(Covering {
            nfn,
            retired_topics: covered.into_iter().map(|c| c.topic_arn).collect(),
            saga,
        })
    }
}

fn stage(
    txn: &mut Transaction,
    nfn: &Notification,
    covered: &[Notification],
    listeners: &[Listener],
) -> Result<()> {
    txn.add(nfn)?;
    for c_nfn in covered {
        txn.add(c_nfn)?;
    }
    for lst in listeners {
        txn.add(lst)?;
    }
    txn.flush()
}
