use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Checkpointer;
use crate::core::{CheckpointError, ConversationState};

/// 进程内检查点（重启即丢失）
#[derive(Default)]
pub struct MemoryCheckpointer {
    states: RwLock<BTreeMap<String, ConversationState>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        self.states
            .write()
            .await
            .insert(state.thread_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        Ok(self.states.read().await.get(thread_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(self.states.read().await.keys().cloned().collect())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.states.write().await.remove(thread_id).is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
