//! Ordered key-value storage under the row store.
//!
//! The row store reads single keys, scans key ranges and applies each
//! committed unit of work as one batch of puts. Rows are never deleted;
//! retired records keep their final state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, Result};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;

/// Persistence seam of the row store.
pub trait KvStore: Send + Sync {
    /// Reads one key.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Key, Value)>>;

    /// Writes every entry or none of them.
    fn write_batch(&self, puts: Vec<(Key, Value)>) -> Result<()>;
}

/// In-memory store with batch fault injection. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Key, Value>>>,
    failing_batches: Arc<AtomicU32>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` batch writes fail without writing anything.
    pub fn fail_next_batches(&self, n: u32) {
        self.failing_batches.store(n, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let data = self.data.read().map_err(|e| EngineError::Kv(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Key, Value)>> {
        let data = self.data.read().map_err(|e| EngineError::Kv(e.to_string()))?;
        Ok(data
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, puts: Vec<(Key, Value)>) -> Result<()> {
        let injected = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngineError::Kv("injected batch failure".to_string()));
        }
        let mut data = self.data.write().map_err(|e| EngineError::Kv(e.to_string()))?;
        data.extend(puts);
        Ok(())
    }
}
