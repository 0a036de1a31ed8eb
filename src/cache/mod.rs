//! Bundle Cache (C7) — TTL-bounded in-process map with no cross-process
//! coherence (spec.md §4.7, §9 "Bundle cache coherence"). A single daemon
//! instance serves all bundle requests; horizontal scaling is out of scope.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Cache key for a subscription bundle: `subscription:<token>`.
pub fn subscription_key(token: &str) -> String {
    format!("subscription:{token}")
}

pub struct BundleCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for BundleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("bundle cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().expect("bundle cache mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries
            .lock()
            .expect("bundle cache mutex poisoned")
            .remove(key);
    }

    /// Invalidate every cached bundle whose key is in `tokens` — used by
    /// admin "rotate server" actions that touch many subscriptions at once
    /// (spec.md §4.7).
    pub fn delete_many(&self, tokens: impl IntoIterator<Item = String>) {
        let mut entries = self.entries.lock().expect("bundle cache mutex poisoned");
        for token in tokens {
            entries.remove(&subscription_key(&token));
        }
    }
}
