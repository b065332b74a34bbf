//! Async task bindings: which channel started an upstream job, so polls for
//! the job go back to the same channel.
//!
//! Supports:
//! - `memory`: in-process map (non-persistent)
//! - `sqlite`: SQLite table keyed by task id

mod memory;
mod sqlite;

pub use memory::InMemoryBindingStore;
pub use sqlite::SqliteBindingStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::ChannelType;
use crate::error::RelayError;

/// Kind of upstream job a binding points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Video,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

/// A task id bound to the channel that created it. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncTaskBinding {
    pub task_id: String,
    pub task_type: TaskType,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    /// Model the caller asked for.
    pub origin_model: String,
    /// Model sent upstream.
    pub actual_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl AsyncTaskBinding {
    pub fn routing(&self) -> RoutingContext {
        RoutingContext {
            channel_id: self.channel_id,
            model: self.actual_model.clone(),
        }
    }
}

/// Fields supplied when a binding is created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBinding {
    pub task_id: String,
    pub task_type: TaskType,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub origin_model: String,
    pub actual_model: String,
}

impl NewBinding {
    fn into_binding(self, now: DateTime<Utc>) -> AsyncTaskBinding {
        AsyncTaskBinding {
            task_id: self.task_id,
            task_type: self.task_type,
            user_id: self.user_id,
            token_id: self.token_id,
            channel_id: self.channel_id,
            channel_type: self.channel_type,
            origin_model: self.origin_model,
            actual_model: self.actual_model,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }
}

/// Pins a poll request to a channel and upstream model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingContext {
    pub channel_id: i64,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("task id '{0}' is already bound")]
    Conflict(String),
    #[error("no binding for task id '{0}'")]
    NotFound(String),
    #[error("binding storage error: {0}")]
    Storage(String),
}

impl From<BindingError> for RelayError {
    fn from(e: BindingError) -> Self {
        match e {
            BindingError::Conflict(id) => RelayError::BindingConflict(id),
            BindingError::NotFound(id) => RelayError::BindingNotFound(id),
            BindingError::Storage(msg) => RelayError::Storage(msg),
        }
    }
}

/// Binding store trait, implemented by all storage backends.
///
/// Uniqueness of `task_id` is enforced by the backend itself, so concurrent
/// creates for the same id yield exactly one winner.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Whether bindings survive a restart.
    fn is_persistent(&self) -> bool;

    /// Insert a binding. Fails with `Conflict` if the task id exists; the
    /// existing binding is left untouched.
    async fn create(&self, binding: NewBinding) -> Result<AsyncTaskBinding, BindingError>;

    /// Look up a binding and refresh `last_accessed_at`. The timestamp never
    /// moves backwards even when resolves race.
    async fn resolve(&self, task_id: &str) -> Result<AsyncTaskBinding, BindingError>;

    /// Look up a binding without touching it.
    async fn get(&self, task_id: &str) -> Result<Option<AsyncTaskBinding>, BindingError>;
}

pub type SharedBindingStore = Arc<dyn BindingStore>;

/// SQLite when a path is configured, in-memory otherwise.
pub async fn open_binding_store(path: Option<PathBuf>) -> Result<SharedBindingStore, BindingError> {
    match path {
        Some(path) => {
            let store = SqliteBindingStore::open(path).await?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No binding database configured, task bindings will not survive restarts");
            Ok(Arc::new(InMemoryBindingStore::new()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn video_binding(task_id: &str, channel_id: i64) -> NewBinding {
        NewBinding {
            task_id: task_id.to_string(),
            task_type: TaskType::Video,
            user_id: 42,
            token_id: 7,
            channel_id,
            channel_type: ChannelType::OpenAI,
            origin_model: "sora-2".to_string(),
            actual_model: "sora-2".to_string(),
        }
    }

    /// Behaviour every backend must share.
    pub(crate) async fn exercise_store(store: &dyn BindingStore) {
        let created = store.create(video_binding("task_xyz", 5)).await.unwrap();
        assert_eq!(created.created_at, created.last_accessed_at);

        let err = store.create(video_binding("task_xyz", 9)).await.unwrap_err();
        assert!(matches!(err, BindingError::Conflict(ref id) if id == "task_xyz"));

        let resolved = store.resolve("task_xyz").await.unwrap();
        assert_eq!(resolved.channel_id, 5);
        assert_eq!(resolved.actual_model, "sora-2");
        assert!(resolved.last_accessed_at >= resolved.created_at);

        let again = store.resolve("task_xyz").await.unwrap();
        assert!(again.last_accessed_at >= resolved.last_accessed_at);

        let err = store.resolve("unknown").await.unwrap_err();
        assert!(matches!(err, BindingError::NotFound(_)));
        assert!(store.get("unknown").await.unwrap().is_none());
        assert_eq!(store.get("task_xyz").await.unwrap().unwrap().channel_id, 5);
    }

    #[test]
    fn errors_map_to_relay_kinds() {
        use crate::error::ErrorKind;
        let e: RelayError = BindingError::Conflict("t".into()).into();
        assert_eq!(e.kind(), ErrorKind::BindingConflict);
        let e: RelayError = BindingError::NotFound("t".into()).into();
        assert_eq!(e.status_code(), 404);
    }

    #[test]
    fn routing_context_uses_actual_model() {
        let mut b = video_binding("t", 3).into_binding(Utc::now());
        b.actual_model = "sora-2-pro".into();
        assert_eq!(
            b.routing(),
            RoutingContext {
                channel_id: 3,
                model: "sora-2-pro".into()
            }
        );
    }
}
