//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，停止接受新请求后依次执行清理：
//! - 关闭能力服务器连接（等待中的调用以 Cancelled 结束，子进程被终止）
//! - 关闭检查点存储

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityRegistry;
use crate::checkpoint::Checkpointer;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// HTTP 服务异常退出
    FatalError(String),
}

/// 关闭信号：axum 的 graceful shutdown 等待其 token
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只记录第一次
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(reason = ?reason, "shutdown requested");
        self.token.cancel();
    }

    /// 安装 Ctrl+C / SIGTERM 处理器
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// 返回未成功完成（失败或超时）的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let mut unfinished = Vec::new();
        for task in &self.tasks {
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = task.name(), "cleanup finished"),
                Ok(Err(e)) => {
                    tracing::warn!(task = task.name(), error = %e, "cleanup failed");
                    unfinished.push(task.name());
                }
                Err(_) => {
                    tracing::warn!(task = task.name(), timeout_secs = self.timeout.as_secs(), "cleanup timed out");
                    unfinished.push(task.name());
                }
            }
        }
        unfinished
    }
}

/// 能力服务器清理：关闭所有连接并终止子进程
pub struct CapabilityServersCleanup {
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityServersCleanup {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CapabilityServersCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.registry.shutdown_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CapabilityServers"
    }
}

/// 检查点存储清理（关闭 SQLite 连接池等）
pub struct CheckpointCleanup {
    checkpointer: Arc<dyn Checkpointer>,
}

impl CheckpointCleanup {
    pub fn new(checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self { checkpointer }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for CheckpointCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.checkpointer.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Checkpoints"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_token_once() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::FatalError("bind failed".into()));
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_every_task_and_reports_timeouts() {
        use crate::capability::testing::SpyBackend;
        use crate::capability::{CapabilityBackend, ConnectionState};
        use crate::checkpoint::MemoryCheckpointer;

        let registry = Arc::new(CapabilityRegistry::new(Duration::from_secs(1)));
        let spy = Arc::new(SpyBackend::new("x", &["echo"]));
        registry.add_client(spy.clone()).await;

        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.register(StuckCleanup);
        coordinator.register(CapabilityServersCleanup::new(registry.clone()));
        coordinator.register(CheckpointCleanup::new(Arc::new(MemoryCheckpointer::new())));

        assert_eq!(coordinator.run_cleanup().await, vec!["Stuck"]);
        assert_eq!(spy.state(), ConnectionState::Closed);
        assert!(registry.resolve("x_echo").await.is_none());
    }
}
