//! The shared in-memory cache: one entry per key, rendered by the UI.
//!
//! Three producers race to mutate entries (optimistic applies, delayed
//! mutation results, push-triggered refetches). All writes to a key go
//! through the per-key entry lock, so concurrent writers never
//! interleave partial updates, and every landed write bumps the key's
//! monotonic version and notifies subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tandem_core::{CacheKey, Entity};

use crate::error::ErrorKind;
use crate::policy::ReconciliationPolicy;

/// Broadcast channel capacity for store updates. Sized for bursts of
/// reconciliations and refetches landing close together.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// One keyed collection in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Ordered entities, as last written by a fetch or mutation.
    pub data: Vec<Entity>,
    /// Monotonic per-key write counter. Bumped by every landed write;
    /// never decreases.
    pub version: u64,
    /// When an authoritative fetch last succeeded. `None` until the
    /// first fetch lands.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Whether an authoritative fetch is in flight for this key.
    pub fetching: bool,
    /// Classification of the last failed fetch, surfaced by the UI as
    /// a degraded-but-populated view.
    pub last_error: Option<ErrorKind>,
}

impl CacheEntry {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            data: Vec::new(),
            version: 0,
            fetched_at: None,
            fetching: false,
            last_error: None,
        }
    }

    /// Whether the entry was fetched recently enough to serve without
    /// refetching.
    pub fn is_fresh(&self, window: Duration) -> bool {
        let Some(fetched_at) = self.fetched_at else {
            return false;
        };
        let age = Utc::now().signed_duration_since(fetched_at);
        match chrono::Duration::from_std(window) {
            Ok(window) => age < window,
            Err(_) => true,
        }
    }
}

/// Notification that a key's entry changed.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub key: CacheKey,
    pub version: u64,
}

/// Keyed table of cache entries; the single source of truth the UI
/// renders.
///
/// Thread-safe and designed for concurrent access from many tasks.
/// Entries are created lazily on first access and live for the
/// process lifetime.
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
    updates_tx: broadcast::Sender<StoreUpdate>,
}

impl CacheStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            entries: DashMap::new(),
            updates_tx,
        })
    }

    /// Subscribe to entry-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates_tx.subscribe()
    }

    /// Get the entry for a key, creating it lazily.
    pub fn get(&self, key: &CacheKey) -> CacheEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()))
            .clone()
    }

    /// Get the entry for a key without creating it.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Deep copy of the current entry, suitable for later restoration.
    pub fn snapshot(&self, key: &CacheKey) -> CacheEntry {
        self.get(key)
    }

    /// Replace a key's data with an authoritative fetch result.
    ///
    /// Bumps the version, stamps `fetched_at`, clears the fetching
    /// flag and any recorded fetch error. Returns the new version.
    pub fn set(&self, key: &CacheKey, data: Vec<Entity>) -> u64 {
        let version = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.data = data;
            entry.version += 1;
            entry.fetched_at = Some(Utc::now());
            entry.fetching = false;
            entry.last_error = None;
            entry.version
        };
        self.notify(key, version);
        trace!(key = %key, version, "store: entry set from fetch");
        version
    }

    /// Atomic read-modify-write of a key's data under the entry lock.
    ///
    /// All mutation to entry data goes through here (or `set`), so
    /// version numbers give a total order over writes to the key.
    /// Returns the new version.
    pub fn patch<F>(&self, key: &CacheKey, f: F) -> u64
    where
        F: FnOnce(&mut Vec<Entity>),
    {
        let version = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            f(&mut entry.data);
            entry.version += 1;
            entry.version
        };
        self.notify(key, version);
        trace!(key = %key, version, "store: entry patched");
        version
    }

    /// Version-gated rollback of a failed mutation.
    ///
    /// Restores `snapshot`'s data only if the policy permits it given
    /// the entry's current version; evaluated under the entry lock so
    /// the check and the restore cannot be interleaved by another
    /// writer. The restore itself is a landed write and bumps the
    /// version (it never rewinds it). Returns whether the snapshot
    /// was restored.
    pub fn try_restore(
        &self,
        key: &CacheKey,
        snapshot: &CacheEntry,
        base_version: u64,
        policy: ReconciliationPolicy,
    ) -> bool {
        let restored = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return false;
            };
            if !policy.permits_rollback(base_version, entry.version) {
                return false;
            }
            entry.data = snapshot.data.clone();
            entry.version += 1;
            Some(entry.version)
        };
        if let Some(version) = restored {
            self.notify(key, version);
            debug!(key = %key, base_version, version, "store: snapshot restored");
            true
        } else {
            false
        }
    }

    /// Mark a key as having an authoritative fetch in flight.
    pub fn begin_fetch(&self, key: &CacheKey) {
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()));
        entry.fetching = true;
    }

    /// Record a failed fetch.
    ///
    /// Existing data is left untouched; only the error classification
    /// and the fetching flag change. The version does not move because
    /// no write landed.
    pub fn fail_fetch(&self, key: &CacheKey, kind: ErrorKind) {
        let version = {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.clone()));
            entry.fetching = false;
            entry.last_error = Some(kind);
            entry.version
        };
        self.notify(key, version);
        debug!(key = %key, ?kind, "store: fetch failed, data preserved");
    }

    /// Number of entries in the store.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries. App-shutdown/test-teardown only.
    pub fn clear(&self) {
        self.entries.clear();
        debug!("store cleared");
    }

    fn notify(&self, key: &CacheKey, version: u64) {
        let update = StoreUpdate {
            key: key.clone(),
            version,
        };
        if self.updates_tx.send(update).is_err() {
            trace!(key = %key, "no subscribers for store update");
        }
    }
}
