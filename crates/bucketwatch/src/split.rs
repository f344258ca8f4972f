//! Removing listeners, splitting a notification back into the narrower
//! notifications its remaining listeners need.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::coverage;
use crate::engine::{Followups, NotificationEngine};
use crate::entity::{Listener, Notification};
use crate::error::{EngineError, Result};
use crate::grouping::group_by_root_prefix;
use crate::saga::{Compensation, Saga};
use crate::store::Transaction;
use crate::types::{ListenerId, ListenerState, NotificationId, NotificationState};

/// Result of removing a listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalOutcome {
    /// True if the listener's notification was deactivated.
    pub notification_deactivated: bool,
    /// Notifications created to replace it, when deactivated.
    pub replacement_notification_ids: Option<Vec<NotificationId>>,
}

impl NotificationEngine {
    pub(crate) async fn remove_listener_in(
        &self,
        txn: &mut Transaction,
        id: &ListenerId,
    ) -> Result<(RemovalOutcome, Followups)> {
        let mut lst = coverage::get_listener(txn, id)?
            .ok_or_else(|| EngineError::ListenerNotFound(id.clone()))?;
        if !lst.is_active() {
            return Err(EngineError::ListenerInactive(id.clone()));
        }

        info!("Deactivating listener {}", lst.id);
        lst.state = ListenerState::Deactivated;
        txn.add(&lst)?;

        let mut nfn = txn
            .get::<Notification>(&lst.notification_id)?
            .ok_or_else(|| EngineError::NotificationNotFound(lst.notification_id.clone()))?;

        if coverage::direct_listeners(txn, &nfn)?.is_empty() {
            // nothing else needs this exact scope
            let retired_topic = nfn.topic_arn.clone();
            let (replacements, saga) = self.unconsolidate(txn, nfn).await?;
            return Ok((
                RemovalOutcome {
                    notification_deactivated: true,
                    replacement_notification_ids: Some(replacements),
                },
                Followups {
                    saga: Some(saga),
                    retired_topics: vec![retired_topic],
                },
            ));
        }

        if !coverage::notification_handlers(txn, &nfn)?.contains_key(&lst.handler_id) {
            // no remaining listener of this notification delivers to the handler
            self.topics.unsubscribe_handler(&mut nfn, &lst.handler_id).await?;
            txn.add(&nfn)?;
        }
        txn.flush()?;

        Ok((
            RemovalOutcome {
                notification_deactivated: false,
                replacement_notification_ids: None,
            },
            Followups::default(),
        ))
    }

    /// Deactivates `nfn` and creates one notification per root prefix among
    /// the listeners still nested under it.
    ///
    /// Returns the new notification ids and the saga undoing the remote work,
    /// to be run if the commit fails.
    async fn unconsolidate(
        &self,
        txn: &mut Transaction,
        mut nfn: Notification,
    ) -> Result<(Vec<NotificationId>, Saga)> {
        info!("Unconsolidating notification {}", nfn.id);
        nfn.state = NotificationState::Deactivated;

        let remaining = coverage::get_covered_listeners(txn, &nfn.bucket, nfn.prefix.as_deref())?;
        let groups = group_by_root_prefix(remaining, |l| l.prefix.as_deref());

        let mut saga = Saga::new("unconsolidate");
        let mut created: Vec<(Notification, Vec<Listener>)> = Vec::with_capacity(groups.len());
        for group in groups {
            let id = NotificationId::generate();
            let topic_arn = match self.topics.create_notification_topic(&id, &nfn.bucket).await {
                Ok(arn) => arn,
                Err(e) => {
                    saga.compensate(&self.topics, &self.bucket_configs).await;
                    return Err(e);
                }
            };
            saga.record(Compensation::DeleteTopic {
                topic_arn: topic_arn.clone(),
            });

            let child = Notification::new(
                id.clone(),
                &nfn.bucket,
                group.root.as_deref(),
                self.topics.topic_name(&id),
                topic_arn,
            );
            let mut members = group.members;
            for lst in members.iter_mut() {
                lst.notification_id = child.id.clone();
            }
            created.push((child, members));
        }
        nfn.unconsolidated = created.iter().map(|(n, _)| n.id.clone()).collect();

        if let Err(e) = stage(txn, &nfn, &created) {
            saga.compensate(&self.topics, &self.bucket_configs).await;
            return Err(e);
        }

        for (child, members) in created.iter_mut() {
            let subscribed = self.subscribe_members(txn, child, members).await;
            if let Err(e) = subscribed.and_then(|_| txn.add(&*child)) {
                saga.compensate(&self.topics, &self.bucket_configs).await;
                return Err(e);
            }
        }

        let retired_config_ids = vec![nfn.topic_config_id.clone()];
        let new_configs: Vec<_> = created
            .iter()
            .map(|(child, _)| child.topic_configuration(&self.config.event_names))
            .collect();
        let added: Vec<String> = new_configs.iter().map(|c| c.id.clone()).collect();
        let id_prefix = self.config.topic_prefix.clone();
        let scope = nfn.prefix.clone();
        let rewrite = self
            .bucket_configs
            .update_topic_configs(&nfn.bucket, move |configs| {
                configs.replace_managed(&id_prefix, scope.as_deref(), &retired_config_ids, new_configs)
            })
            .await;
        match rewrite {
            Ok(removed) => saga.record(Compensation::RevertTopicConfigs {
                bucket: nfn.bucket.clone(),
                added,
                removed,
            }),
            Err(e) => {
                error!("Failed to unconsolidate notification {}", nfn.id);
                saga.compensate(&self.topics, &self.bucket_configs).await;
                return Err(e);
            }
        }

        Ok((nfn.unconsolidated, saga))
    }

    async fn subscribe_members(
        &self,
        txn: &Transaction,
        child: &mut Notification,
        members: &[Listener],
    ) -> Result<()> {
        for handler in coverage::listener_handlers(txn, members)?.values() {
            self.topics.subscribe_handler(child, handler).await?;
        }
        Ok(())
    }
}

fn stage(txn: &mut Transaction, retired: &Notification, created: &[(Notification, Vec<Listener>)]) -> Result<()> {
    txn.add(retired)?;
    for (child, members) in created {
        txn.add(child)?;
        for lst in members {
            txn.add(lst)?;
        }
    }
    txn.flush()
}
