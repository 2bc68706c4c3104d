//! The engine facade: one object wiring the cache, query, mutation
//! and realtime layers together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use tandem_core::{CacheKey, ResourceFilter};

use crate::error::SyncError;
use crate::mutation::MutationCoordinator;
use crate::policy::ReconciliationPolicy;
use crate::query::{DEFAULT_STALENESS, QueryExecutor};
use crate::realtime::{ChangeListener, WatchGuard};
use crate::remote::RemoteService;
use crate::store::{CacheEntry, CacheStore, StoreUpdate};

/// Configures and builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    remote: Arc<dyn RemoteService>,
    staleness: Duration,
    policy: ReconciliationPolicy,
}

impl SyncEngineBuilder {
    /// Override the staleness window for cached reads.
    pub fn staleness(mut self, window: Duration) -> Self {
        self.staleness = window;
        self
    }

    /// Override the rollback conflict policy.
    pub fn policy(mut self, policy: ReconciliationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> SyncEngine {
        let store = CacheStore::new();
        let executor = Arc::new(
            QueryExecutor::new(Arc::clone(&store), Arc::clone(&self.remote))
                .with_staleness(self.staleness),
        );
        let listener = ChangeListener::new(Arc::clone(&executor), Arc::clone(&self.remote));
        let mutations = MutationCoordinator::new(Arc::clone(&store), self.policy);
        info!(staleness = ?self.staleness, policy = ?self.policy, "sync engine built");
        SyncEngine {
            store,
            executor,
            mutations,
            listener,
            remote: self.remote,
        }
    }
}

/// Client-side synchronization engine for one workspace session.
///
/// Owns the shared [`CacheStore`] and routes every read and write
/// through the layers that keep it consistent: authoritative fetches
/// with request coalescing, optimistic mutations with version-gated
/// rollback, and push-driven refetches.
pub struct SyncEngine {
    store: Arc<CacheStore>,
    executor: Arc<QueryExecutor>,
    pub(crate) mutations: MutationCoordinator,
    listener: Arc<ChangeListener>,
    pub(crate) remote: Arc<dyn RemoteService>,
}

impl SyncEngine {
    /// Build an engine with default configuration.
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self::builder(remote).build()
    }

    pub fn builder(remote: Arc<dyn RemoteService>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            remote,
            staleness: DEFAULT_STALENESS,
            policy: ReconciliationPolicy::default(),
        }
    }

    /// The shared cache.
    pub fn store(&self) -> Arc<CacheStore> {
        Arc::clone(&self.store)
    }

    /// Read a collection, serving from cache while fresh.
    pub async fn fetch(&self, filter: &ResourceFilter) -> Result<CacheEntry, SyncError> {
        self.executor.fetch(filter).await
    }

    /// Force an authoritative refetch, coalescing with any in-flight
    /// fetch for the same key.
    pub async fn revalidate(&self, filter: &ResourceFilter) -> Result<CacheEntry, SyncError> {
        self.executor.revalidate(filter).await
    }

    /// Mark a key stale so the next read refetches.
    pub fn invalidate(&self, key: &CacheKey) {
        self.executor.invalidate(key);
    }

    /// Observe a collection: fetch it, subscribe to push changes, and
    /// stream entry updates until the observation is dropped.
    ///
    /// A fetch failure still yields an observation; the entry carries
    /// its previous data and the error classification.
    pub async fn observe(&self, filter: &ResourceFilter) -> Observation {
        let key = filter.cache_key();
        // Subscribe before fetching so the fetch's own update is not
        // missed.
        let updates = self.store.subscribe();
        let guard = self.listener.watch(filter);
        let initial = match self.executor.fetch(filter).await {
            Ok(entry) => entry,
            Err(_) => self.store.get(&key),
        };
        Observation {
            key,
            store: Arc::clone(&self.store),
            updates,
            initial,
            _guard: guard,
        }
    }

    /// Stop all realtime watchers. Pending fetches and mutations run
    /// to completion on their own.
    pub fn shutdown(&self) {
        self.listener.stop_all();
        info!("sync engine shut down");
    }
}

/// A live view over one collection.
///
/// Holds the realtime subscription for its filter; dropping the
/// observation releases it.
pub struct Observation {
    key: CacheKey,
    store: Arc<CacheStore>,
    updates: broadcast::Receiver<StoreUpdate>,
    /// The entry as of when the observation started.
    pub initial: CacheEntry,
    _guard: WatchGuard,
}

impl Observation {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The entry's current state.
    pub fn entry(&self) -> CacheEntry {
        self.store.get(&self.key)
    }

    /// Wait for the next change to this observation's key and return
    /// the entry's new state. Updates to other keys are skipped; if
    /// the subscriber lagged, the current state is returned so no
    /// change is silently lost.
    pub async fn changed(&mut self) -> CacheEntry {
        loop {
            match self.updates.recv().await {
                Ok(update) if update.key == self.key => return self.store.get(&self.key),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => return self.store.get(&self.key),
                // The store outlives the observation (it holds an Arc),
                // so the channel cannot close; return the current state
                // if it somehow does.
                Err(broadcast::error::RecvError::Closed) => return self.store.get(&self.key),
            }
        }
    }
}
