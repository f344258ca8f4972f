//! Transactional row store over a [`KvStore`].
//!
//! A [`Transaction`] stages every write in memory and reads through its own
//! staged writes. `flush` checks the staged rows against the integrity rules
//! without ending the unit of work, `commit` flushes and applies all writes as
//! one batch, and `rollback` discards them.
//!
//! Rows live under `<table>/<id>`. Rows that belong to a bucket are also
//! listed under `<table>@<bucket>/<id>`, so per-bucket queries only touch that
//! bucket's rows.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::entity::{Handler, Listener, Notification};
use crate::error::{EngineError, Result};
use crate::kvstore::{Key, KvStore, Value};
use crate::protocol::Protocol;

/// A row type stored in its own table.
pub trait Record: Serialize + DeserializeOwned {
    /// Table name, used as the key prefix.
    const TABLE: &'static str;
    /// Primary key type.
    type Id: fmt::Display;

    /// Primary key of this row.
    fn id(&self) -> &Self::Id;

    /// Bucket the row is listed under, if its table is bucket scoped.
    fn bucket(&self) -> Option<&str> {
        None
    }
}

fn table_prefix(table: &str) -> Key {
    format!("{}/", table).into_bytes()
}

fn row_key(table: &str, id: &dyn fmt::Display) -> Key {
    format!("{}/{}", table, id).into_bytes()
}

fn bucket_prefix(table: &str, bucket: &str) -> Key {
    format!("{}@{}/", table, bucket).into_bytes()
}

fn bucket_key(table: &str, bucket: &str, id: &dyn fmt::Display) -> Key {
    format!("{}@{}/{}", table, bucket, id).into_bytes()
}

fn handler_index_key(protocol: Protocol, endpoint: &str) -> Key {
    format!("handler_endpoint/{}\0{}", protocol, endpoint).into_bytes()
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    Ok(bincode::deserialize(bytes)?)
}

/// Shared handle to the committed rows.
pub struct Store {
    kv: Arc<dyn KvStore>,
    commit_lock: Mutex<()>,
}

impl Store {
    /// Creates a store over the given KV backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            commit_lock: Mutex::new(()),
        })
    }

    /// Begins a new unit of work.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction {
            store: Arc::clone(self),
            writes: BTreeMap::new(),
            unflushed: BTreeSet::new(),
        }
    }

    /// Reads a committed row.
    pub fn get<R: Record>(&self, id: &R::Id) -> Result<Option<R>> {
        match self.kv.get(&row_key(R::TABLE, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the handler for (protocol, endpoint), creating and committing
    /// it if none exists.
    ///
    /// Handlers are shared by every bucket, so creation is its own unit of
    /// work under the commit lock rather than part of a bucket operation.
    pub fn get_or_create_handler(&self, protocol: Protocol, endpoint: &str) -> Result<Handler> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| EngineError::Kv(e.to_string()))?;

        let index_key = handler_index_key(protocol, endpoint);
        if let Some(id_bytes) = self.kv.get(&index_key)? {
            let id = String::from_utf8_lossy(&id_bytes).into_owned().into();
            return self
                .get::<Handler>(&id)?
                .ok_or(EngineError::HandlerNotFound(id));
        }

        let handler = Handler::new(protocol, endpoint);
        self.kv.write_batch(vec![
            (row_key(Handler::TABLE, &handler.id), bincode::serialize(&handler)?),
            (index_key, handler.id.as_str().as_bytes().to_vec()),
        ])?;
        debug!(
            "Created handler {} for {} endpoint {}",
            handler.id, protocol, endpoint
        );
        Ok(handler)
    }

    fn apply(&self, writes: BTreeMap<Key, Value>) -> Result<()> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| EngineError::Kv(e.to_string()))?;
        self.kv.write_batch(writes.into_iter().collect())
    }
}

/// A unit of work against the [`Store`].
pub struct Transaction {
    store: Arc<Store>,
    writes: BTreeMap<Key, Value>,
    unflushed: BTreeSet<Key>,
}

impl Transaction {
    fn read(&self, key: &[u8]) -> Result<Option<Value>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(Some(value.clone()));
        }
        self.store.kv.get(key)
    }

    /// Reads a row, seeing this transaction's own writes.
    pub fn get<R: Record>(&self, id: &R::Id) -> Result<Option<R>> {
        match self.read(&row_key(R::TABLE, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads every row of a bucket-scoped table listed under `bucket`, in id order.
    pub fn scan_bucket<R: Record>(&self, bucket: &str) -> Result<Vec<R>> {
        let prefix = bucket_prefix(R::TABLE, bucket);
        let mut ids: BTreeSet<Value> = self
            .store
            .kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        ids.extend(
            self.writes
                .range::<[u8], _>((std::ops::Bound::Included(prefix.as_slice()), std::ops::Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(_, id)| id.clone()),
        );

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let key = [table_prefix(R::TABLE), id].concat();
            let bytes = self.read(&key)?.ok_or_else(|| {
                EngineError::Kv(format!(
                    "bucket index entry without row: {}",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            rows.push(decode(&bytes)?);
        }
        Ok(rows)
    }

    /// Inserts or replaces a row.
    pub fn add<R: Record>(&mut self, row: &R) -> Result<()> {
        let key = row_key(R::TABLE, row.id());
        let value = bincode::serialize(row)?;
        if let Some(bucket) = row.bucket() {
            let id_bytes = row.id().to_string().into_bytes();
            self.writes
                .insert(bucket_key(R::TABLE, bucket, row.id()), id_bytes);
        }
        self.writes.insert(key.clone(), value);
        self.unflushed.insert(key);
        Ok(())
    }

    /// Checks rows written since the last flush against the integrity rules.
    ///
    /// A listener must reference an existing handler and notification, and an
    /// active listener must reference an active notification. Notification
    /// config ids are unique within a bucket, and a retired notification keeps
    /// no active listener.
    pub fn flush(&mut self) -> Result<()> {
        if self.unflushed.is_empty() {
            return Ok(());
        }
        let listener_prefix = table_prefix(Listener::TABLE);
        let notification_prefix = table_prefix(Notification::TABLE);

        let mut listeners = Vec::new();
        let mut notifications = Vec::new();
        for key in &self.unflushed {
            let Some(bytes) = self.writes.get(key) else {
                continue;
            };
            if key.starts_with(&listener_prefix) {
                listeners.push(decode::<Listener>(bytes)?);
            } else if key.starts_with(&notification_prefix) {
                notifications.push(decode::<Notification>(bytes)?);
            }
        }

        for lst in &listeners {
            if self.get::<Handler>(&lst.handler_id)?.is_none() {
                return Err(EngineError::Constraint(format!(
                    "listener {} references missing handler {}",
                    lst.id, lst.handler_id
                )));
            }
            let nfn = self.get::<Notification>(&lst.notification_id)?.ok_or_else(|| {
                EngineError::Constraint(format!(
                    "listener {} references missing notification {}",
                    lst.id, lst.notification_id
                ))
            })?;
            if lst.is_active() && !nfn.is_active() {
                return Err(EngineError::Constraint(format!(
                    "active listener {} references {} notification {}",
                    lst.id, nfn.state, nfn.id
                )));
            }
        }

        let buckets: BTreeSet<&str> = notifications.iter().map(|n| n.bucket.as_str()).collect();
        for bucket in buckets {
            let bucket_notifications = self.scan_bucket::<Notification>(bucket)?;
            let bucket_listeners = self.scan_bucket::<Listener>(bucket)?;
            for nfn in notifications.iter().filter(|n| n.bucket == bucket) {
                if bucket_notifications
                    .iter()
                    .any(|n| n.id != nfn.id && n.topic_config_id == nfn.topic_config_id)
                {
                    return Err(EngineError::Constraint(format!(
                        "duplicate topic config id {} on {}",
                        nfn.topic_config_id, bucket
                    )));
                }
                if !nfn.is_active() {
                    if let Some(lst) = bucket_listeners
                        .iter()
                        .find(|l| l.is_active() && l.notification_id == nfn.id)
                    {
                        return Err(EngineError::Constraint(format!(
                            "{} notification {} still owns active listener {}",
                            nfn.state, nfn.id, lst.id
                        )));
                    }
                }
            }
        }

        self.unflushed.clear();
        Ok(())
    }

    /// Flushes and applies every staged write atomically.
    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        if self.writes.is_empty() {
            return Ok(());
        }
        let writes = std::mem::take(&mut self.writes);
        self.store.apply(writes)
    }

    /// Discards every staged write. The transaction stays usable.
    pub fn rollback(&mut self) {
        self.writes.clear();
        self.unflushed.clear();
    }
}
