//! Gatekeeper HTTP 服务
//!
//! 启动: cargo run（可选参数：配置文件路径）
//! 入口：初始化日志、加载配置、启动能力服务器、组装编排器，然后运行 HTTP 对话接口直到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gatekeeper::capability::{
    connect_servers, CapabilityRegistry, InMemoryRetriever, RetrieveDocuments, SearchDocuments,
};
use gatekeeper::checkpoint::create_checkpointer;
use gatekeeper::config::load_config;
use gatekeeper::core::{
    create_llm_from_config, AgentOrchestrator, CapabilityServersCleanup, CheckpointCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use gatekeeper::observability;
use gatekeeper::server::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    // 能力注册表：本地检索能力 + 配置中的能力服务器
    let registry = Arc::new(
        CapabilityRegistry::new(Duration::from_secs(cfg.capabilities.invocation_timeout_secs))
            .with_sensitive(cfg.approval.sensitive_capabilities.clone()),
    );

    let retriever = Arc::new(InMemoryRetriever::new());
    for path in &cfg.retrieval.documents {
        match retriever.load_file(path) {
            Ok(n) => tracing::info!(path = %path.display(), documents = n, "knowledge base file loaded"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load knowledge base file"),
        }
    }
    registry
        .register_local(RetrieveDocuments::new(retriever.clone(), cfg.retrieval.default_k))
        .await;
    registry
        .register_local(SearchDocuments::new(retriever, cfg.retrieval.default_k))
        .await;

    let failures = connect_servers(&registry, &cfg).await;
    if !failures.is_empty() {
        tracing::warn!(
            "{} capability server(s) failed to start: {}",
            failures.len(),
            failures
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    tracing::info!(
        capabilities = registry.list().await.len(),
        servers = registry.servers().await.len(),
        "capability registry ready"
    );

    let checkpointer = create_checkpointer(&cfg.checkpoint).await;
    tracing::info!(backend = checkpointer.backend(), "checkpointer ready");

    let llm = create_llm_from_config(&cfg);
    let orchestrator = Arc::new(
        AgentOrchestrator::new(llm, Arc::clone(&registry), Arc::clone(&checkpointer))
            .with_system_prompt(cfg.app.system_prompt.clone())
            .with_max_model_turns(cfg.app.max_model_turns),
    );

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let bind = cfg.server.bind.clone();
    let state = Arc::new(AppState::new(orchestrator, cfg));
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("Gatekeeper listening on http://{}", bind);

    let token = shutdown.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(ref e) = served {
        tracing::error!(error = %e, "HTTP server stopped with error");
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(10));
    coordinator.register(CapabilityServersCleanup::new(registry));
    coordinator.register(CheckpointCleanup::new(checkpointer));
    let unfinished = coordinator.run_cleanup().await;
    if !unfinished.is_empty() {
        tracing::warn!(tasks = ?unfinished, "some cleanup tasks did not finish");
    }

    served.context("HTTP server failed")?;
    Ok(())
}
