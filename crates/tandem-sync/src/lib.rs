//! Cache synchronization engine for the Tandem workspace client.
//!
//! Keeps one in-memory cache consistent across three competing
//! producers: user reads, optimistic user writes, and realtime change
//! notifications from other sessions.
//!
//! ## Features
//!
//! - **Store**: versioned, thread-safe cache keyed by resource filter
//! - **Query**: authoritative fetches with per-key request coalescing
//!   and a staleness window
//! - **Mutation**: optimistic writes with temp-id reconciliation and
//!   version-gated rollback
//! - **Realtime**: WebSocket change subscriptions that trigger
//!   refetches, with exponential-backoff resubscription

mod error;
pub mod http;
mod mutation;
mod policy;
pub mod query;
pub mod realtime;
mod remote;
pub mod store;
mod sync;

mod ops;

pub use error::{ErrorKind, MutationError, SyncError};
pub use http::HttpRemoteService;
pub use mutation::{MutationCoordinator, MutationOutcome};
pub use policy::ReconciliationPolicy;
pub use query::{DEFAULT_STALENESS, QueryExecutor};
pub use realtime::{ChangeListener, WatchGuard};
pub use remote::{ChangeStream, RemoteService, WriteOp};
pub use store::{CacheEntry, CacheStore, StoreUpdate};
pub use sync::{Observation, SyncEngine, SyncEngineBuilder};
