//! Push-driven cache refresh.
//!
//! One watcher task runs per subscribed filter. A push event is only a
//! hint that the collection changed: the watcher responds by forcing an
//! authoritative refetch through the query path, never by applying the
//! event payload to the cache directly. Dropped subscriptions are
//! reestablished with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use tandem_core::{CacheKey, ChangeEvent, ResourceFilter};

use crate::query::QueryExecutor;
use crate::remote::RemoteService;

/// Initial delay before reattempting a dropped subscription.
const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap on the resubscribe backoff.
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(60);

struct Watcher {
    refs: usize,
    stop_tx: watch::Sender<bool>,
}

/// Manages realtime subscriptions, one watcher task per filter.
///
/// Watchers are refcounted: repeated [`ChangeListener::watch`] calls
/// for the same filter share one subscription, and the watcher stops
/// when the last [`WatchGuard`] drops.
pub struct ChangeListener {
    executor: Arc<QueryExecutor>,
    remote: Arc<dyn RemoteService>,
    watchers: DashMap<CacheKey, Watcher>,
}

impl ChangeListener {
    pub fn new(executor: Arc<QueryExecutor>, remote: Arc<dyn RemoteService>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            remote,
            watchers: DashMap::new(),
        })
    }

    /// Start (or join) the watcher for a filter.
    ///
    /// The subscription stays alive until the returned guard and all
    /// other guards for the same filter are dropped.
    pub fn watch(self: &Arc<Self>, filter: &ResourceFilter) -> WatchGuard {
        use dashmap::mapref::entry::Entry;

        let key = filter.cache_key();
        match self.watchers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let watcher = occupied.get_mut();
                watcher.refs += 1;
                if watcher.stop_tx.is_closed() {
                    // The task behind this entry is gone; a joined
                    // guard must still be backed by a live watcher.
                    watcher.stop_tx = self.spawn_watcher(filter);
                    debug!(key = %key, "realtime: watcher task replaced");
                } else {
                    trace!(key = %key, refs = watcher.refs, "realtime: joined existing watcher");
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Watcher {
                    refs: 1,
                    stop_tx: self.spawn_watcher(filter),
                });
                debug!(key = %key, "realtime: watcher started");
            }
        }

        WatchGuard {
            listener: Arc::clone(self),
            key,
        }
    }

    fn spawn_watcher(&self, filter: &ResourceFilter) -> watch::Sender<bool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let executor = Arc::clone(&self.executor);
        let remote = Arc::clone(&self.remote);
        let filter = filter.clone();
        tokio::spawn(async move {
            run_watcher(executor, remote, filter, stop_rx).await;
        });
        stop_tx
    }

    /// Number of live watcher tasks.
    pub fn active_watchers(&self) -> usize {
        self.watchers.len()
    }

    /// Stop every watcher. Used on engine shutdown.
    pub fn stop_all(&self) {
        self.watchers.retain(|key, watcher| {
            let _ = watcher.stop_tx.send(true);
            debug!(key = %key, "realtime: watcher stopped on shutdown");
            false
        });
    }

    fn release(&self, key: &CacheKey) {
        use dashmap::mapref::entry::Entry;

        // Decrement, stop and removal happen under one entry lock, so
        // a concurrent `watch` either joins the watcher before the
        // last guard drops or finds the entry gone and spawns afresh.
        if let Entry::Occupied(mut occupied) = self.watchers.entry(key.clone()) {
            let watcher = occupied.get_mut();
            watcher.refs -= 1;
            if watcher.refs > 0 {
                trace!(key = %key, refs = watcher.refs, "realtime: guard released");
                return;
            }
            let _ = watcher.stop_tx.send(true);
            occupied.remove();
            debug!(key = %key, "realtime: last guard released, watcher stopping");
        }
    }
}

/// Keeps one filter's subscription alive; dropping it releases the
/// subscription's refcount.
pub struct WatchGuard {
    listener: Arc<ChangeListener>,
    key: CacheKey,
}

impl WatchGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.listener.release(&self.key);
    }
}

/// Subscription loop for one filter.
///
/// Resubscribes with exponential backoff when the push channel drops;
/// the backoff resets after each successful subscribe.
async fn run_watcher(
    executor: Arc<QueryExecutor>,
    remote: Arc<dyn RemoteService>,
    filter: ResourceFilter,
    mut stop_rx: watch::Receiver<bool>,
) {
    let key = filter.cache_key();
    let mut delay = RESUBSCRIBE_BASE_DELAY;

    loop {
        if *stop_rx.borrow() {
            return;
        }

        match remote.subscribe(&filter).await {
            Ok(mut stream) => {
                info!(key = %key, "realtime: subscribed");
                delay = RESUBSCRIBE_BASE_DELAY;

                loop {
                    tokio::select! {
                        biased;

                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                debug!(key = %key, "realtime: watcher received stop signal");
                                return;
                            }
                        }

                        event = stream.recv() => {
                            match event {
                                Some(event) => {
                                    // A burst of events for the same
                                    // filter warrants one refetch, not
                                    // one per event.
                                    let mut coalesced = 0usize;
                                    while stream.try_recv().is_ok() {
                                        coalesced += 1;
                                    }
                                    if coalesced > 0 {
                                        trace!(key = %key, coalesced, "realtime: coalesced change events");
                                    }
                                    handle_event(&executor, &filter, event).await;
                                }
                                None => {
                                    warn!(key = %key, "realtime: push channel dropped, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "realtime: subscribe failed");
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
    }
}

/// React to one push event: force a refetch of the affected key.
///
/// The event names the filter that changed; its payload is not trusted
/// as data. A failed refetch is recorded on the entry by the query path
/// and not escalated here.
async fn handle_event(executor: &Arc<QueryExecutor>, filter: &ResourceFilter, event: ChangeEvent) {
    let key = event.filter.cache_key();
    trace!(key = %key, op = ?event.op, "realtime: change event");
    if &event.filter != filter {
        // Defensive only; a subscription should not deliver events for
        // other filters.
        warn!(subscribed = %filter.cache_key(), key = %key, "realtime: event for foreign filter");
    }
    executor.invalidate(&key);
    if let Err(e) = executor.revalidate(&event.filter).await {
        warn!(key = %key, error = %e, "realtime: push-triggered refetch failed");
    }
}
