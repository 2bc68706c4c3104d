//! User-facing workspace operations.
//!
//! Each operation pairs an optimistic cache transformation with the
//! remote write that confirms it, and runs the pair through the
//! mutation protocol. The UI sees the optimistic state immediately;
//! reconciliation or rollback follows when the remote answers.

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::instrument;

use tandem_core::{
    Comment, Entity, EntityId, Kudos, Post, ResourceFilter, Task, TaskStatus, TempId,
};

use crate::error::{MutationError, SyncError};
use crate::mutation::MutationOutcome;
use crate::remote::WriteOp;
use crate::sync::SyncEngine;

fn encode(entity: &Entity) -> Result<serde_json::Value, MutationError> {
    serde_json::to_value(entity).map_err(|e| MutationError {
        source: SyncError::Json(e),
        rolled_back: false,
    })
}

impl SyncEngine {
    /// Publish a new post. The feed shows the placeholder immediately;
    /// it is replaced in place by the server's canonical post.
    #[instrument(skip(self, body))]
    pub async fn create_post(
        &self,
        author: &str,
        body: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let temp = TempId::generate();
        let post = Entity::Post(Post {
            id: temp.as_id().clone(),
            author: author.to_string(),
            body: body.to_string(),
            likes: Vec::new(),
            created_at: Utc::now(),
        });
        let payload = encode(&post)?;

        let filter = ResourceFilter::Posts;
        self.mutations
            .mutate(
                &filter.cache_key(),
                Some(&temp),
                move |data| data.push(post),
                self.remote.mutate(WriteOp::Create {
                    resource: filter,
                    value: payload,
                }),
            )
            .await
    }

    /// Toggle one user's like on a post: like it if they have not,
    /// unlike it if they have. The toggle is computed inside the apply
    /// step, under the entry lock, so rapid toggles observe each other
    /// and a refetch landing just before the apply is never clobbered.
    #[instrument(skip(self))]
    pub async fn toggle_like(
        &self,
        post_id: &EntityId,
        user: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let filter = ResourceFilter::Posts;
        let key = filter.cache_key();

        if !self.store().get(&key).data.iter().any(|e| e.id() == post_id) {
            return Err(MutationError {
                source: SyncError::Validation(format!("unknown post: {post_id}")),
                rolled_back: false,
            });
        }

        let (computed_tx, computed_rx) = oneshot::channel();
        let id = post_id.clone();
        let user = user.to_string();
        let apply = move |data: &mut Vec<Entity>| {
            if let Some(Entity::Post(post)) = data.iter_mut().find(|e| e.id() == &id) {
                if post.liked_by(&user) {
                    post.likes.retain(|u| u != &user);
                } else {
                    post.likes.push(user.clone());
                }
                let _ = computed_tx.send(Entity::Post(post.clone()));
            }
        };

        let remote = self.remote.clone();
        let id = post_id.clone();
        let confirm = async move {
            // The sender drops without sending when the post vanished
            // between the pre-check and the apply.
            let entity = computed_rx
                .await
                .map_err(|_| SyncError::Validation(format!("unknown post: {id}")))?;
            let value = serde_json::to_value(&entity)?;
            remote
                .mutate(WriteOp::Update {
                    resource: filter,
                    id,
                    value,
                })
                .await
        };

        self.mutations.mutate(&key, None, apply, confirm).await
    }

    /// Add a message to a conversation.
    #[instrument(skip(self, body))]
    pub async fn add_comment(
        &self,
        conversation_id: &str,
        author: &str,
        body: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let temp = TempId::generate();
        let comment = Entity::Comment(Comment {
            id: temp.as_id().clone(),
            parent_id: EntityId::new(conversation_id),
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        });
        let payload = encode(&comment)?;

        let filter = ResourceFilter::Conversation {
            id: conversation_id.to_string(),
        };
        self.mutations
            .mutate(
                &filter.cache_key(),
                Some(&temp),
                move |data| data.push(comment),
                self.remote.mutate(WriteOp::Create {
                    resource: filter,
                    value: payload,
                }),
            )
            .await
    }

    /// Create a task on someone's list.
    #[instrument(skip(self, title))]
    pub async fn create_task(
        &self,
        title: &str,
        assignee: &str,
        due: Option<chrono::DateTime<Utc>>,
    ) -> Result<MutationOutcome, MutationError> {
        let temp = TempId::generate();
        let task = Entity::Task(Task {
            id: temp.as_id().clone(),
            title: title.to_string(),
            assignee: assignee.to_string(),
            status: TaskStatus::Open,
            due,
            created_at: Utc::now(),
        });
        let payload = encode(&task)?;

        let filter = ResourceFilter::Tasks {
            assignee: assignee.to_string(),
        };
        self.mutations
            .mutate(
                &filter.cache_key(),
                Some(&temp),
                move |data| data.push(task),
                self.remote.mutate(WriteOp::Create {
                    resource: filter,
                    value: payload,
                }),
            )
            .await
    }

    /// Move a task to a new status. Applied under the entry lock like
    /// [`SyncEngine::toggle_like`], so the rest of the task row is
    /// whatever the cache holds at apply time.
    #[instrument(skip(self))]
    pub async fn set_task_status(
        &self,
        assignee: &str,
        task_id: &EntityId,
        status: TaskStatus,
    ) -> Result<MutationOutcome, MutationError> {
        let filter = ResourceFilter::Tasks {
            assignee: assignee.to_string(),
        };
        let key = filter.cache_key();

        if !self.store().get(&key).data.iter().any(|e| e.id() == task_id) {
            return Err(MutationError {
                source: SyncError::Validation(format!("unknown task: {task_id}")),
                rolled_back: false,
            });
        }

        let (computed_tx, computed_rx) = oneshot::channel();
        let id = task_id.clone();
        let apply = move |data: &mut Vec<Entity>| {
            if let Some(Entity::Task(task)) = data.iter_mut().find(|e| e.id() == &id) {
                task.status = status;
                let _ = computed_tx.send(Entity::Task(task.clone()));
            }
        };

        let remote = self.remote.clone();
        let id = task_id.clone();
        let confirm = async move {
            let entity = computed_rx
                .await
                .map_err(|_| SyncError::Validation(format!("unknown task: {id}")))?;
            let value = serde_json::to_value(&entity)?;
            remote
                .mutate(WriteOp::Update {
                    resource: filter,
                    id,
                    value,
                })
                .await
        };

        self.mutations.mutate(&key, None, apply, confirm).await
    }

    /// Send recognition to a teammate.
    #[instrument(skip(self, message))]
    pub async fn send_kudos(
        &self,
        from: &str,
        to: &str,
        message: &str,
    ) -> Result<MutationOutcome, MutationError> {
        let temp = TempId::generate();
        let kudos = Entity::Kudos(Kudos {
            id: temp.as_id().clone(),
            from: from.to_string(),
            to: to.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        let payload = encode(&kudos)?;

        let filter = ResourceFilter::Kudos;
        self.mutations
            .mutate(
                &filter.cache_key(),
                Some(&temp),
                move |data| data.push(kudos),
                self.remote.mutate(WriteOp::Create {
                    resource: filter,
                    value: payload,
                }),
            )
            .await
    }

    /// Delete a post the user authored. Optimistically removed from
    /// the feed; restored if the remote rejects the delete and nothing
    /// newer landed meanwhile.
    #[instrument(skip(self))]
    pub async fn delete_post(
        &self,
        post_id: &EntityId,
    ) -> Result<MutationOutcome, MutationError> {
        let filter = ResourceFilter::Posts;
        let id = post_id.clone();
        let removed_id = post_id.clone();
        self.mutations
            .mutate(
                &filter.cache_key(),
                None,
                move |data| data.retain(|e| e.id() != &removed_id),
                self.remote.mutate(WriteOp::Delete {
                    resource: filter,
                    id,
                }),
            )
            .await
    }
}
