//! Per-bucket serialization of listener changes.
//!
//! Consolidation and splitting read the coverage index and then rewrite it;
//! two requests on the same bucket must not interleave between those steps.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard held for the duration of one bucket operation.
pub type BucketGuard = OwnedMutexGuard<()>;

/// One async mutex per bucket, created on first use.
#[derive(Default)]
pub struct BucketLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BucketLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `bucket`.
    pub async fn lock(&self, bucket: &str) -> BucketGuard {
        let mutex = self
            .locks
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Number of buckets seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no bucket was locked yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_bucket_is_exclusive() {
        let locks = Arc::new(BucketLocks::new());
        let guard = locks.lock("b").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("b").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_buckets_do_not_block() {
        let locks = BucketLocks::new();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        assert_eq!(locks.len(), 2);
    }
}
