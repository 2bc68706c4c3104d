//! The seam to the remote data service.
//!
//! The engine consumes the service through this trait; production
//! code uses [`crate::http::HttpRemoteService`], tests script their
//! own implementations.

use async_trait::async_trait;
use tokio::sync::mpsc;

use tandem_core::{ChangeEvent, Entity, EntityId, ResourceFilter};

use crate::error::SyncError;

/// A push channel scoped to one resource filter.
///
/// The stream ends (`recv` returns `None`) when the connection drops;
/// dropping the receiver closes the subscription.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// One write operation against the remote service.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create a record in a resource's collection. The payload carries
    /// the client's view of the entity (including its temp id); the
    /// service responds with the canonical, server-id'd entity.
    Create {
        resource: ResourceFilter,
        value: serde_json::Value,
    },
    /// Update an existing record. The service responds with the full
    /// canonical entity after the update.
    Update {
        resource: ResourceFilter,
        id: EntityId,
        value: serde_json::Value,
    },
    /// Delete a record. No entity comes back.
    Delete {
        resource: ResourceFilter,
        id: EntityId,
    },
}

/// Client interface to the remote data service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the full, authoritative collection for a filter.
    async fn query(&self, filter: &ResourceFilter) -> Result<Vec<Entity>, SyncError>;

    /// Execute one write. Returns the canonical entity for creates and
    /// updates, `None` for deletes.
    async fn mutate(&self, op: WriteOp) -> Result<Option<Entity>, SyncError>;

    /// Open a push channel for change events on a filter.
    async fn subscribe(&self, filter: &ResourceFilter) -> Result<ChangeStream, SyncError>;
}
