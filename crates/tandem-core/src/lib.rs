//! Shared data model for the Tandem workspace client.
//!
//! This crate holds the types every collaborative screen reads and
//! writes through the sync engine:
//!
//! - **Identifiers**: cache keys, server entity ids, client temp ids
//! - **Resource filters**: the logical resources a screen can observe
//! - **Records**: the tagged entity kinds (posts, comments, tasks, kudos)
//!   and the decode boundary that converts untyped remote payloads
//!   into them
//! - **Change events**: push notifications describing out-of-band writes

pub mod records;
pub mod types;

pub use records::{
    Comment, Entity, Kudos, Post, Task, TaskStatus, decode_entity, decode_rows, reconcile_temp,
    upsert_entity,
};
pub use types::{
    CacheKey, ChangeEvent, ChangeOp, EntityId, FilterParseError, ResourceFilter, TempId,
};
