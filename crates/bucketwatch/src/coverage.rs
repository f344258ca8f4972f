//! Coverage queries: which notifications and listeners serve a bucket path.

use std::collections::BTreeMap;

use crate::entity::{Handler, Listener, Notification};
use crate::error::{EngineError, Result};
use crate::store::Transaction;
use crate::types::{covers, HandlerId, ListenerId, NotificationId};

/// The unique active notification on `bucket` whose scope covers `prefix`.
///
/// Finding more than one means the coverage invariant is broken; that is
/// reported as [`EngineError::OverlappingNotifications`] and never resolved here.
pub fn get_covering_notification(
    txn: &Transaction,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Option<Notification>> {
    let mut found: Option<Notification> = None;
    for nfn in active_notifications(txn, bucket)? {
        if !covers(nfn.prefix.as_deref(), prefix) {
            continue;
        }
        if found.is_some() {
            return Err(EngineError::OverlappingNotifications {
                bucket: bucket.to_string(),
                prefix: prefix.map(str::to_string),
            });
        }
        found = Some(nfn);
    }
    Ok(found)
}

/// Active notifications on `bucket` nested at or under `prefix`.
pub fn get_covered_notifications(
    txn: &Transaction,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Vec<Notification>> {
    Ok(active_notifications(txn, bucket)?
        .into_iter()
        .filter(|n| covers(prefix, n.prefix.as_deref()))
        .collect())
}

/// Active listeners on `bucket` nested at or under `prefix`, sorted by prefix.
///
/// A whole-bucket listener sorts first. Ties keep id order so the result is stable.
pub fn get_covered_listeners(
    txn: &Transaction,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Vec<Listener>> {
    let mut listeners: Vec<Listener> = txn
        .scan_bucket::<Listener>(bucket)?
        .into_iter()
        .filter(|l| l.is_active() && covers(prefix, l.prefix.as_deref()))
        .collect();
    listeners.sort_by(|a, b| a.prefix.cmp(&b.prefix));
    Ok(listeners)
}

/// True if an active listener nested under `prefix` delivers to `endpoint`.
pub fn exists_endpoint_listening(
    txn: &Transaction,
    bucket: &str,
    prefix: Option<&str>,
    endpoint: &str,
) -> Result<bool> {
    for lst in get_covered_listeners(txn, bucket, prefix)? {
        let handler = txn
            .get::<Handler>(&lst.handler_id)?
            .ok_or_else(|| EngineError::HandlerNotFound(lst.handler_id.clone()))?;
        if handler.endpoint == endpoint {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every active notification on `bucket`.
pub fn active_notifications(txn: &Transaction, bucket: &str) -> Result<Vec<Notification>> {
    Ok(txn
        .scan_bucket::<Notification>(bucket)?
        .into_iter()
        .filter(Notification::is_active)
        .collect())
}

/// Loads a listener by id, active or not.
pub fn get_listener(txn: &Transaction, id: &ListenerId) -> Result<Option<Listener>> {
    txn.get::<Listener>(id)
}

/// Active listeners routed through `nfn`.
pub fn notification_listeners(txn: &Transaction, nfn: &Notification) -> Result<Vec<Listener>> {
    routed_listeners(txn, &nfn.bucket, std::slice::from_ref(&nfn.id))
}

/// Active listeners on `bucket` routed through any of `notification_ids`.
pub fn routed_listeners(
    txn: &Transaction,
    bucket: &str,
    notification_ids: &[NotificationId],
) -> Result<Vec<Listener>> {
    Ok(txn
        .scan_bucket::<Listener>(bucket)?
        .into_iter()
        .filter(|l| l.is_active() && notification_ids.contains(&l.notification_id))
        .collect())
}

/// Active listeners of `nfn` that require exactly its scope.
pub fn direct_listeners(txn: &Transaction, nfn: &Notification) -> Result<Vec<Listener>> {
    Ok(notification_listeners(txn, nfn)?
        .into_iter()
        .filter(|l| nfn.is_direct(l))
        .collect())
}

/// Distinct handlers of the given listeners, keyed by id.
pub fn listener_handlers(
    txn: &Transaction,
    listeners: &[Listener],
) -> Result<BTreeMap<HandlerId, Handler>> {
    let mut handlers = BTreeMap::new();
    for lst in listeners {
        if handlers.contains_key(&lst.handler_id) {
            continue;
        }
        let handler = txn
            .get::<Handler>(&lst.handler_id)?
            .ok_or_else(|| EngineError::HandlerNotFound(lst.handler_id.clone()))?;
        handlers.insert(handler.id.clone(), handler);
    }
    Ok(handlers)
}

/// Distinct handlers of the active listeners routed through `nfn`.
pub fn notification_handlers(
    txn: &Transaction,
    nfn: &Notification,
) -> Result<BTreeMap<HandlerId, Handler>> {
    listener_handlers(txn, &notification_listeners(txn, nfn)?)
}
