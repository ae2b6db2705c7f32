//! In-memory cache of precomputed read results.
//!
//! Entries expire after their TTL (lazily on read, and by a periodic sweep)
//! and the table is bounded: inserting a new key at capacity evicts the entry
//! created earliest. Values are stored as `serde_json::Value` and every read
//! hands back a fresh deserialized copy.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::logging::{debug, info, obj, v_int, v_str, warn, Domain};

pub mod views;

pub use views::ViewCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("value for {key} cannot be cached: {reason}")]
    Unsupported { key: String, reason: String },
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
    /// Insertion order, breaks ties between equal creation instants.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub max_entries: usize,
}

/// A key bound to the shape stored under it.
pub struct TypedKey<T> {
    key: String,
    _shape: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), _shape: PhantomData }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

pub struct CacheLayer {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
    default_ttl: Duration,
    seq: AtomicU64,
}

impl CacheLayer {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic mid-update cannot leave an entry half-written, so a
        // poisoned table is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the live value under `key`. Expired entries are removed.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.remove(key);
        None
    }

    /// A fresh `T` decoded from the live value. A shape mismatch is a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_raw(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(err) => {
                warn(
                    Domain::Cache,
                    "decode_failed",
                    obj(&[("key", v_str(key)), ("error", v_str(&err.to_string()))]),
                );
                None
            }
        }
    }

    /// Stores `value` until `now + ttl`; `Duration::ZERO` means the default TTL.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Unsupported {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();
        let entry = Entry {
            value,
            created_at: now,
            expires_at: now + ttl,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut entries = self.lock();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            if let Some(evicted) = oldest_key(&entries) {
                entries.remove(&evicted);
                debug(Domain::Cache, "evicted", obj(&[("key", v_str(&evicted))]));
            }
        }
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn get_typed<T: DeserializeOwned>(&self, key: &TypedKey<T>) -> Option<T> {
        self.get(key.as_str())
    }

    pub fn set_typed<T: Serialize>(&self, key: &TypedKey<T>, value: &T, ttl: Duration) -> Result<(), CacheError> {
        self.set(key.as_str(), value, ttl)
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Removes every key matching `pattern`: `*` matches all, `prefix*`
    /// matches by prefix, anything else must match exactly.
    pub fn invalidate_by_prefix(&self, pattern: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !matches_pattern(key, pattern));
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            debug(
                Domain::Cache,
                "invalidated",
                obj(&[("pattern", v_str(pattern)), ("removed", v_int(removed as i64))]),
            );
        }
        removed
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Physical entry count, including expired entries not yet purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.lock();
        let valid = entries.values().filter(|e| e.is_live(now)).count();
        CacheStats {
            total: entries.len(),
            valid,
            expired: entries.len() - valid,
            max_entries: self.max_entries,
        }
    }

    /// Periodically drops expired entries until shutdown is signalled.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info(Domain::Cache, "sweeper_stopped", obj(&[]));
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let purged = self.purge_expired();
                    let stats = self.stats();
                    info(
                        Domain::Cache,
                        "sweep",
                        obj(&[
                            ("purged", v_int(purged as i64)),
                            ("total", v_int(stats.total as i64)),
                            ("valid", v_int(stats.valid as i64)),
                            ("max_entries", v_int(stats.max_entries as i64)),
                        ]),
                    );
                }
            }
        }
    }
}

fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

fn oldest_key(entries: &HashMap<String, Entry>) -> Option<String> {
    entries
        .iter()
        .min_by_key(|(_, e)| (e.created_at, e.seq))
        .map(|(k, _)| k.clone())
}
