//! Compensating actions for operations spanning the store, the topic broker
//! and the bucket configuration.
//!
//! Each remote side effect that can be undone is recorded as it happens. On
//! failure the recorded compensations run newest first; each is best effort
//! and a failing compensation does not stop the rest. A saga is only
//! completed once the local commit has succeeded.

use std::fmt;
use tracing::{debug, warn};

use crate::bucket_config::{BucketConfigAdapter, TopicConfiguration};
use crate::error::Result;
use crate::topic::TopicAdapter;

/// Undo action for one remote side effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compensation {
    /// A topic was created.
    DeleteTopic {
        /// Topic to delete.
        topic_arn: String,
    },
    /// An endpoint was subscribed to a topic that outlives the operation.
    Unsubscribe {
        /// Subscription to remove.
        subscription_ref: String,
    },
    /// The bucket's topic entries were rewritten.
    RevertTopicConfigs {
        /// Bucket whose configuration was rewritten.
        bucket: String,
        /// Ids of the entries the rewrite inserted.
        added: Vec<String>,
        /// Entries the rewrite removed.
        removed: Vec<TopicConfiguration>,
    },
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteTopic { topic_arn } => write!(f, "delete topic {}", topic_arn),
            Compensation::Unsubscribe { subscription_ref } => {
                write!(f, "unsubscribe {}", subscription_ref)
            }
            Compensation::RevertTopicConfigs {
                bucket,
                added,
                removed,
            } => write!(
                f,
                "revert topic configs on {} ({} added, {} removed)",
                bucket,
                added.len(),
                removed.len()
            ),
        }
    }
}

/// Ordered record of compensations for one operation.
#[derive(Debug)]
pub struct Saga {
    name: &'static str,
    steps: Vec<Compensation>,
}

impl Saga {
    /// An empty saga; `name` prefixes its log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Records the undo action of a side effect that just happened.
    pub fn record(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    /// Number of recorded compensations.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every recorded compensation, newest first.
    ///
    /// Returns the number of compensations that failed.
    pub async fn compensate(
        mut self,
        topics: &TopicAdapter,
        bucket_configs: &BucketConfigAdapter,
    ) -> usize {
        let mut failed = 0;
        while let Some(step) = self.steps.pop() {
            debug!("{}: compensating with {}", self.name, step);
            if let Err(e) = run(&step, topics, bucket_configs).await {
                warn!("{}: compensation '{}' failed: {}", self.name, step, e);
                failed += 1;
            }
        }
        failed
    }

    /// Ends the saga without compensating.
    pub fn complete(self) {
        debug!("{}: completed with {} recorded steps", self.name, self.steps.len());
    }
}

async fn run(
    step: &Compensation,
    topics: &TopicAdapter,
    bucket_configs: &BucketConfigAdapter,
) -> Result<()> {
    match step {
        Compensation::DeleteTopic { topic_arn } => topics.delete_topic(topic_arn).await,
        Compensation::Unsubscribe { subscription_ref } => topics.unsubscribe(subscription_ref).await,
        Compensation::RevertTopicConfigs {
            bucket,
            added,
            removed,
        } => {
            let removed = removed.clone();
            bucket_configs
                .update_topic_configs(bucket, move |configs| configs.restore(added, removed))
                .await
        }
    }
}
