//! Dynamic store: the path-keyed publish/subscribe key-value store the
//! daemon publishes results into and reads desired configuration from.
//!
//! Keys are `/`-separated paths (`setup/network/service/<id>/ipv6`,
//! `state/network/interface/<if>/ipv6/<id>`). Prefix subscriptions deliver
//! the changed key into the daemon's event loop; a write that does not change
//! the stored value is not a change and produces no notification.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

struct Subscription {
    prefix: String,
    tx: UnboundedSender<String>,
}

/// In-process dynamic store.
pub struct Store {
    entries: BTreeMap<String, Value>,
    subscriptions: Vec<Subscription>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            entries: BTreeMap::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Set `key` to `value`. No-op (and no notification) if unchanged.
    pub fn set(&mut self, key: &str, value: Value) {
        if self.entries.get(key) == Some(&value) {
            return;
        }
        trace!(key, "store set");
        self.entries.insert(key.to_string(), value);
        self.notify(key);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key` entirely. Notifies only if the key existed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let old = self.entries.remove(key);
        if old.is_some() {
            trace!(key, "store remove");
            self.notify(key);
        }
        old
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn list(&self, prefix: &str) -> Vec<(String, Value)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Deliver every future change under `prefix` to `tx`.
    pub fn subscribe(&mut self, prefix: &str, tx: UnboundedSender<String>) {
        self.subscriptions.push(Subscription {
            prefix: prefix.to_string(),
            tx,
        });
    }

    fn notify(&mut self, key: &str) {
        self.subscriptions
            .retain(|s| !key.starts_with(&s.prefix) || s.tx.send(key.to_string()).is_ok());
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
