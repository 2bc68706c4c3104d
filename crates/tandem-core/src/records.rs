//! The tagged entity kinds and the payload decode boundary.
//!
//! Remote rows arrive as untyped JSON. Everything past
//! [`decode_rows`] works with the typed [`Entity`] variants; untyped
//! payloads never drive cache structure beyond this boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::EntityId;

/// A feed post with its like set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: EntityId,
    pub author: String,
    pub body: String,
    /// User ids that have liked this post.
    #[serde(default)]
    pub likes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn liked_by(&self, user: &str) -> bool {
        self.likes.iter().any(|u| u == user)
    }
}

/// A comment on a post or a message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: EntityId,
    /// The post or conversation this comment belongs to.
    pub parent_id: EntityId,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Status of an assigned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
}

/// A task assigned to a workspace member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    pub assignee: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A recognition message from one member to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kudos {
    pub id: EntityId,
    pub from: String,
    pub to: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A record in a cached collection, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Post(Post),
    Comment(Comment),
    Task(Task),
    Kudos(Kudos),
}

impl Entity {
    /// The entity's identifier (server-assigned or temp).
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Post(p) => &p.id,
            Entity::Comment(c) => &c.id,
            Entity::Task(t) => &t.id,
            Entity::Kudos(k) => &k.id,
        }
    }

    /// Kind tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Post(_) => "post",
            Entity::Comment(_) => "comment",
            Entity::Task(_) => "task",
            Entity::Kudos(_) => "kudos",
        }
    }
}

/// Decode a single remote row into a typed entity.
pub fn decode_entity(value: serde_json::Value) -> Result<Entity, serde_json::Error> {
    serde_json::from_value(value)
}

/// Decode a fetched collection, skipping rows that fail validation.
///
/// A malformed row degrades the view instead of failing the whole
/// fetch; the skip is logged for investigation.
pub fn decode_rows(rows: Vec<serde_json::Value>) -> Vec<Entity> {
    let total = rows.len();
    let entities: Vec<Entity> = rows
        .into_iter()
        .filter_map(|row| match decode_entity(row) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(error = %e, "skipping undecodable row from remote");
                None
            }
        })
        .collect();
    if entities.len() < total {
        warn!(
            decoded = entities.len(),
            total, "collection decoded with skipped rows"
        );
    }
    entities
}

/// Insert or replace an entity by its own id, preserving order.
///
/// If an entity with the same id exists it is replaced in place,
/// otherwise the entity is appended.
pub fn upsert_entity(data: &mut Vec<Entity>, entity: Entity) {
    if let Some(existing) = data.iter_mut().find(|e| e.id() == entity.id()) {
        *existing = entity;
    } else {
        data.push(entity);
    }
}

/// Replace a temp placeholder with its server-confirmed counterpart.
///
/// If the temp id is still present it is replaced in place. If a
/// refetch already removed it, the server entity is upserted by its
/// own id instead. Either way the result holds the server entity
/// exactly once and the temp id not at all.
pub fn reconcile_temp(data: &mut Vec<Entity>, temp_id: &EntityId, server: Entity) {
    if let Some(slot) = data.iter_mut().find(|e| e.id() == temp_id) {
        *slot = server;
        // A refetch racing the reconcile can have inserted the server
        // entity alongside the placeholder; keep exactly one.
        dedup_by_id(data);
    } else {
        upsert_entity(data, server);
    }
}

/// Keep the first occurrence of each id, dropping later duplicates.
fn dedup_by_id(data: &mut Vec<Entity>) {
    let mut seen = std::collections::HashSet::new();
    data.retain(|e| seen.insert(e.id().clone()));
}
