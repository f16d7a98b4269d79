//! 对话检查点：挂起与恢复的持久化边界
//!
//! - MemoryCheckpointer：进程内（测试 / 临时运行）
//! - FileCheckpointer：每个线程一个 JSON 文件，写临时文件后 rename（默认）
//! - SqliteCheckpointer：sqlx SQLite，需要 `async-sqlite` feature

mod file;
mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

pub use file::FileCheckpointer;
pub use memory::MemoryCheckpointer;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointer;

use crate::config::CheckpointSection;
use crate::core::{CheckpointError, ConversationState};

/// 检查点存储
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// 覆盖写入该线程的最新状态
    async fn save(&self, state: &ConversationState) -> Result<(), CheckpointError>;

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>, CheckpointError>;

    /// 所有已保存的线程 ID（排序）
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;

    /// 删除；不存在返回 false
    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError>;

    /// 后端名（日志 / 健康检查用）
    fn backend(&self) -> &'static str;

    /// 关闭底层资源（连接池等）
    async fn close(&self) {}
}

/// 根据配置创建检查点存储；SQLite 未编译或打开失败时退回内存实现
pub async fn create_checkpointer(cfg: &CheckpointSection) -> Arc<dyn Checkpointer> {
    match cfg.backend.to_lowercase().as_str() {
        "memory" => Arc::new(MemoryCheckpointer::new()),
        "file" => Arc::new(FileCheckpointer::new(&cfg.path)),
        "sqlite" => {
            #[cfg(feature = "async-sqlite")]
            {
                match SqliteCheckpointer::new(&cfg.path).await {
                    Ok(store) => return Arc::new(store),
                    Err(e) => {
                        tracing::warn!(error = %e, "SQLite checkpointer unavailable, using in-memory checkpoints");
                    }
                }
            }
            #[cfg(not(feature = "async-sqlite"))]
            {
                tracing::warn!("async-sqlite feature not enabled, using in-memory checkpoints");
            }
            Arc::new(MemoryCheckpointer::new())
        }
        other => {
            tracing::warn!(backend = other, "unknown checkpoint backend, using in-memory checkpoints");
            Arc::new(MemoryCheckpointer::new())
        }
    }
}
