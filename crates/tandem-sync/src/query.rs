//! Authoritative fetches with per-key request de-duplication.
//!
//! At most one fetch is in flight per key: concurrent callers for the
//! same key coalesce onto the in-flight request instead of issuing a
//! second one. Fetch failures never wipe existing data; they only
//! record an error classification on the entry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use tandem_core::{CacheKey, ResourceFilter};

use crate::error::SyncError;
use crate::remote::RemoteService;
use crate::store::{CacheEntry, CacheStore};

/// Window within which a cached entry is served without refetching.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(30);

/// Fetches authoritative collections and writes them into the store.
pub struct QueryExecutor {
    store: Arc<CacheStore>,
    remote: Arc<dyn RemoteService>,
    staleness: Duration,
    /// In-flight fetch markers; followers await the receiver.
    in_flight: DashMap<CacheKey, watch::Receiver<bool>>,
    /// Keys that must refetch on next read regardless of staleness.
    invalidated: DashSet<CacheKey>,
}

impl QueryExecutor {
    pub fn new(store: Arc<CacheStore>, remote: Arc<dyn RemoteService>) -> Self {
        Self {
            store,
            remote,
            staleness: DEFAULT_STALENESS,
            in_flight: DashMap::new(),
            invalidated: DashSet::new(),
        }
    }

    /// Override the staleness window.
    pub fn with_staleness(mut self, window: Duration) -> Self {
        self.staleness = window;
        self
    }

    /// Mark a key so the next read refetches regardless of staleness.
    pub fn invalidate(&self, key: &CacheKey) {
        self.invalidated.insert(key.clone());
        trace!(key = %key, "query: key invalidated");
    }

    /// Read a collection, serving from cache while fresh.
    ///
    /// Refetches if the entry has never been fetched, is older than
    /// the staleness window, or was invalidated.
    pub async fn fetch(&self, filter: &ResourceFilter) -> Result<CacheEntry, SyncError> {
        let key = filter.cache_key();
        if !self.invalidated.contains(&key) {
            if let Some(entry) = self.store.peek(&key) {
                if entry.is_fresh(self.staleness) {
                    trace!(key = %key, "query: served fresh from cache");
                    return Ok(entry);
                }
            }
        }
        self.revalidate(filter).await
    }

    /// Refetch a collection now, joining any in-flight fetch for the
    /// same key rather than issuing a second one.
    ///
    /// Followers of an in-flight fetch return the entry the leader
    /// produced; if the leader's fetch failed, the entry carries
    /// `last_error` and its previous data intact.
    pub async fn revalidate(&self, filter: &ResourceFilter) -> Result<CacheEntry, SyncError> {
        use dashmap::mapref::entry::Entry;

        let key = filter.cache_key();

        // Claim leadership or pick up the in-flight marker. The guard
        // must not be held across an await.
        let leader_tx = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let mut rx = occupied.get().clone();
                drop(occupied);
                trace!(key = %key, "query: joining in-flight fetch");
                // Either the leader signals completion or drops the
                // sender; both wake us.
                let _ = rx.changed().await;
                return Ok(self.store.get(&key));
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx);
                tx
            }
        };

        self.store.begin_fetch(&key);
        debug!(key = %key, "query: fetching collection");

        let result = self.remote.query(filter).await;

        // Remove the marker before waking followers so a later
        // revalidation starts a new fetch instead of joining this one.
        self.in_flight.remove(&key);

        match result {
            Ok(entities) => {
                let version = self.store.set(&key, entities);
                self.invalidated.remove(&key);
                let _ = leader_tx.send(true);
                debug!(key = %key, version, "query: collection refreshed");
                Ok(self.store.get(&key))
            }
            Err(e) => {
                self.store.fail_fetch(&key, e.kind());
                let _ = leader_tx.send(true);
                warn!(key = %key, error = %e, "query: fetch failed, keeping cached data");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;

    use tandem_core::{Entity, EntityId, Kudos};

    use crate::remote::{ChangeStream, WriteOp};

    fn kudos(id: &str) -> Entity {
        Entity::Kudos(Kudos {
            id: EntityId::from(id),
            from: "alice".into(),
            to: "bob".into(),
            message: "thanks".into(),
            created_at: Utc::now(),
        })
    }

    /// Remote whose queries block on a gate and count invocations.
    struct GatedRemote {
        gate: Arc<Notify>,
        calls: AtomicUsize,
        rows: Vec<Entity>,
        fail: bool,
    }

    impl GatedRemote {
        fn new(rows: Vec<Entity>) -> Self {
            Self {
                gate: Arc::new(Notify::new()),
                calls: AtomicUsize::new(0),
                rows,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl RemoteService for GatedRemote {
        async fn query(&self, _filter: &ResourceFilter) -> Result<Vec<Entity>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                Err(SyncError::Remote {
                    status: 503,
                    message: "unavailable".into(),
                })
            } else {
                Ok(self.rows.clone())
            }
        }

        async fn mutate(&self, _op: WriteOp) -> Result<Option<Entity>, SyncError> {
            unimplemented!("not used by query tests")
        }

        async fn subscribe(&self, _filter: &ResourceFilter) -> Result<ChangeStream, SyncError> {
            unimplemented!("not used by query tests")
        }
    }

    #[tokio::test]
    async fn concurrent_revalidations_coalesce_into_one_fetch() {
        let store = CacheStore::new();
        let remote = Arc::new(GatedRemote::new(vec![kudos("k-1")]));
        let executor = Arc::new(QueryExecutor::new(store, remote.clone()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                executor.revalidate(&ResourceFilter::Kudos).await
            }));
        }

        // Let all three tasks reach the executor before opening the gate.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.gate.notify_waiters();

        for handle in handles {
            let entry = handle.await.unwrap().unwrap();
            assert_eq!(entry.data.len(), 1);
        }
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_serves_fresh_cache_without_remote_call() {
        let store = CacheStore::new();
        let remote = Arc::new(GatedRemote::new(vec![kudos("k-1")]));
        let executor = QueryExecutor::new(Arc::clone(&store), remote.clone());

        store.set(&ResourceFilter::Kudos.cache_key(), vec![kudos("k-1")]);

        let entry = executor.fetch(&ResourceFilter::Kudos).await.unwrap();
        assert_eq!(entry.data.len(), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch_despite_freshness() {
        let store = CacheStore::new();
        let remote = Arc::new(GatedRemote::new(vec![kudos("k-1"), kudos("k-2")]));
        let executor = QueryExecutor::new(Arc::clone(&store), remote.clone());

        let key = ResourceFilter::Kudos.cache_key();
        store.set(&key, vec![kudos("k-1")]);
        executor.invalidate(&key);
        remote.gate.notify_one();

        // The gate is already released; the refetch proceeds immediately.
        let fetch = executor.fetch(&ResourceFilter::Kudos);
        let entry = tokio::time::timeout(Duration::from_secs(1), fetch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.data.len(), 2);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_preserves_data_and_records_error() {
        let store = CacheStore::new();
        let mut remote = GatedRemote::new(vec![]);
        remote.fail = true;
        let remote = Arc::new(remote);
        let executor = QueryExecutor::new(Arc::clone(&store), remote.clone());

        let key = ResourceFilter::Kudos.cache_key();
        store.set(&key, vec![kudos("k-1"), kudos("k-2"), kudos("k-3")]);
        executor.invalidate(&key);
        remote.gate.notify_one();

        let result = executor.fetch(&ResourceFilter::Kudos).await;
        assert!(result.is_err());

        let entry = store.get(&key);
        assert_eq!(entry.data.len(), 3);
        assert_eq!(entry.last_error, Some(crate::error::ErrorKind::Network));
        assert!(!entry.fetching);
    }
}
