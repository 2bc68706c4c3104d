//! Identifiers and resource addressing for the shared cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved prefix that marks a client-generated placeholder id.
///
/// Server-assigned ids never start with this prefix, so a `temp-` id
/// can always be told apart from a persisted one.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Identifies one logical collection in the cache (e.g. `posts`,
/// `tasks:alice`, `conversation:c42:messages`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An entity identifier, either server-assigned or a client temp id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether this id is a client-generated placeholder awaiting
    /// reconciliation with a server-assigned id.
    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A freshly generated client placeholder id.
///
/// Wraps an [`EntityId`] carrying the `temp-` prefix; the wrapper type
/// keeps mutation call sites from passing a server id where a
/// placeholder is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(EntityId);

impl TempId {
    /// Generate a new unique temp id.
    pub fn generate() -> Self {
        Self(EntityId(format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())))
    }

    pub fn as_id(&self) -> &EntityId {
        &self.0
    }

    pub fn into_id(self) -> EntityId {
        self.0
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The logical resources a screen can observe.
///
/// Each filter maps to exactly one [`CacheKey`]; the realtime push
/// channel is also scoped per filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceFilter {
    /// The global posts/likes/comments resource group.
    Posts,
    /// One user's assigned task list.
    Tasks { assignee: String },
    /// Messages within one conversation.
    Conversation { id: String },
    /// The recognition/kudos feed.
    Kudos,
}

impl ResourceFilter {
    /// The cache key this filter's collection lives under.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey(self.to_string())
    }

    /// Parse the canonical string form (the inverse of `Display`).
    pub fn parse(s: &str) -> Result<Self, FilterParseError> {
        match s {
            "posts" => return Ok(Self::Posts),
            "kudos" => return Ok(Self::Kudos),
            _ => {}
        }
        if let Some(assignee) = s.strip_prefix("tasks:") {
            if !assignee.is_empty() {
                return Ok(Self::Tasks {
                    assignee: assignee.to_string(),
                });
            }
        }
        if let Some(rest) = s.strip_prefix("conversation:") {
            if let Some(id) = rest.strip_suffix(":messages") {
                if !id.is_empty() {
                    return Ok(Self::Conversation { id: id.to_string() });
                }
            }
        }
        Err(FilterParseError(s.to_string()))
    }
}

impl std::fmt::Display for ResourceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Posts => write!(f, "posts"),
            Self::Tasks { assignee } => write!(f, "tasks:{}", assignee),
            Self::Conversation { id } => write!(f, "conversation:{}:messages", id),
            Self::Kudos => write!(f, "kudos"),
        }
    }
}

/// Error for an unrecognized resource filter string.
#[derive(Debug, Clone, Error)]
#[error("unknown resource filter: {0}")]
pub struct FilterParseError(pub String);

/// The kind of write a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A push notification that some session wrote to a resource.
///
/// The payload shape from the push transport is not trusted as
/// complete; consumers refetch the affected collection instead of
/// applying the event directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub filter: ResourceFilter,
}
