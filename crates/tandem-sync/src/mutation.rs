//! Optimistic mutation protocol: apply locally, confirm remotely,
//! reconcile or roll back.
//!
//! Each call to [`MutationCoordinator::mutate`] is one independent
//! mutation instance. Rapid repeated mutations on the same key each
//! capture their own base version; correctness under interleaving
//! follows from the version-gated rollback rule, not from serializing
//! the mutations themselves.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use tandem_core::{CacheKey, Entity, TempId, reconcile_temp, upsert_entity};

use crate::error::{MutationError, SyncError};
use crate::policy::ReconciliationPolicy;
use crate::store::{CacheEntry, CacheStore};

/// Bookkeeping captured before the optimistic apply, driving the
/// reconcile-or-rollback phase.
struct MutationRecord {
    snapshot: CacheEntry,
    base_version: u64,
}

/// Terminal state of a successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// The canonical entity the remote returned, if any (deletes
    /// return none).
    pub entity: Option<Entity>,
    /// The key's version after reconciliation landed.
    pub version: u64,
}

/// Executes user-initiated writes against one cache key.
#[derive(Clone)]
pub struct MutationCoordinator {
    store: Arc<CacheStore>,
    policy: ReconciliationPolicy,
}

impl MutationCoordinator {
    pub fn new(store: Arc<CacheStore>, policy: ReconciliationPolicy) -> Self {
        Self { store, policy }
    }

    /// Run one optimistic mutation to completion.
    ///
    /// Protocol:
    /// 1. snapshot the entry and record its version;
    /// 2. apply the optimistic transformation under the entry lock;
    /// 3. await the remote call;
    /// 4. on success, reconcile the cache with the canonical entity
    ///    (replacing `temp_id` if one was given, never duplicating);
    /// 5. on failure, restore the snapshot only if nothing else has
    ///    landed on the key since step 2; otherwise keep the newer
    ///    state and only report the error.
    ///
    /// The remote error is always surfaced to the caller, whether or
    /// not the rollback was applied. The remote call is never retried
    /// here.
    pub async fn mutate<A, Fut>(
        &self,
        key: &CacheKey,
        temp_id: Option<&TempId>,
        apply: A,
        remote: Fut,
    ) -> Result<MutationOutcome, MutationError>
    where
        A: FnOnce(&mut Vec<Entity>),
        Fut: Future<Output = Result<Option<Entity>, SyncError>>,
    {
        let record = {
            let snapshot = self.store.snapshot(key);
            let base_version = snapshot.version;
            MutationRecord {
                snapshot,
                base_version,
            }
        };

        let version = self.store.patch(key, apply);
        debug!(key = %key, base_version = record.base_version, version, "mutation: optimistic apply");

        match remote.await {
            Ok(server_entity) => {
                let (entity, version) = match (temp_id, server_entity) {
                    (Some(temp), Some(entity)) => {
                        let temp_id = temp.as_id().clone();
                        let reconciled = entity.clone();
                        let version = self
                            .store
                            .patch(key, |data| reconcile_temp(data, &temp_id, entity));
                        (Some(reconciled), version)
                    }
                    (None, Some(entity)) => {
                        let canonical = entity.clone();
                        let version = self.store.patch(key, |data| upsert_entity(data, entity));
                        (Some(canonical), version)
                    }
                    (Some(temp), None) => {
                        // The remote confirmed but returned no entity;
                        // the placeholder has nothing to reconcile
                        // against, so drop it.
                        warn!(key = %key, temp_id = %temp, "mutation: confirmed without entity, dropping placeholder");
                        let temp_id = temp.as_id().clone();
                        let version = self
                            .store
                            .patch(key, |data| data.retain(|e| e.id() != &temp_id));
                        (None, version)
                    }
                    // Deletes: the optimistic removal stands.
                    (None, None) => (None, version),
                };
                debug!(key = %key, version, "mutation: reconciled");
                Ok(MutationOutcome { entity, version })
            }
            Err(e) => {
                let rolled_back = self.store.try_restore(
                    key,
                    &record.snapshot,
                    record.base_version,
                    self.policy,
                );
                if rolled_back {
                    debug!(key = %key, base_version = record.base_version, error = %e, "mutation: failed, snapshot restored");
                } else {
                    // Not an error state of its own: the key advanced
                    // past this mutation, so the cache keeps the newer
                    // (possibly conflicting) truth.
                    warn!(key = %key, base_version = record.base_version, error = %e, "mutation: failed after key advanced, rollback skipped");
                }
                Err(MutationError {
                    source: e,
                    rolled_back,
                })
            }
        }
    }
}
