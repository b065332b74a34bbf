//! In-memory binding store (non-persistent).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{AsyncTaskBinding, BindingError, BindingStore, NewBinding};

#[derive(Clone, Default)]
pub struct InMemoryBindingStore {
    bindings: Arc<RwLock<HashMap<String, AsyncTaskBinding>>>,
}

impl InMemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BindingStore for InMemoryBindingStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create(&self, binding: NewBinding) -> Result<AsyncTaskBinding, BindingError> {
        let mut bindings = self.bindings.write().await;
        match bindings.entry(binding.task_id.clone()) {
            Entry::Occupied(_) => Err(BindingError::Conflict(binding.task_id)),
            Entry::Vacant(slot) => Ok(slot.insert(binding.into_binding(Utc::now())).clone()),
        }
    }

    async fn resolve(&self, task_id: &str) -> Result<AsyncTaskBinding, BindingError> {
        let mut bindings = self.bindings.write().await;
        let binding = bindings
            .get_mut(task_id)
            .ok_or_else(|| BindingError::NotFound(task_id.to_string()))?;
        let now = Utc::now();
        if now > binding.last_accessed_at {
            binding.last_accessed_at = now;
        }
        Ok(binding.clone())
    }

    async fn get(&self, task_id: &str) -> Result<Option<AsyncTaskBinding>, BindingError> {
        Ok(self.bindings.read().await.get(task_id).cloned())
    }
}
