//! 能力层：能力服务器协议与客户端、注册表、密钥替换、知识库检索

pub mod client;
pub mod protocol;
pub mod registry;
pub mod retrieval;
pub mod secrets;
pub mod testing;

use std::sync::Arc;

pub use client::{CapabilityClient, ClientOptions, ConnectionState};
pub use protocol::{CapabilityDescriptor, ServerInfo};
pub use registry::{
    Capability, CapabilityBackend, CapabilityInfo, CapabilityRegistry, LocalCapability, Provider,
    ServerStatus,
};
pub use retrieval::{Chunk, InMemoryRetriever, RetrieveDocuments, Retriever, SearchDocuments};

use crate::config::AppConfig;
use crate::core::CapabilityError;

/// 并发启动所有启用的服务器，按名称顺序注册成功的连接。
/// 单个服务器失败只记录日志并返回，不影响其它服务器。
pub async fn connect_servers(
    registry: &CapabilityRegistry,
    cfg: &AppConfig,
) -> Vec<(String, CapabilityError)> {
    let options = ClientOptions::from(&cfg.capabilities);
    let mut tasks = tokio::task::JoinSet::new();
    for (name, entry) in &cfg.servers {
        if !entry.enabled {
            tracing::info!(server = %name, "capability server disabled, skipping");
            continue;
        }
        let (name, entry, options) = (name.clone(), entry.clone(), options.clone());
        tasks.spawn(async move {
            let result = CapabilityClient::spawn(&name, &entry, options).await;
            (name, result)
        });
    }

    let mut connected = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(client))) => connected.push((name, client)),
            Ok((name, Err(e))) => {
                if e.is_configuration() {
                    tracing::error!(server = %name, error = %e, "capability server misconfigured");
                } else {
                    tracing::warn!(server = %name, error = %e, "capability server failed to start");
                }
                failures.push((name, e));
            }
            Err(e) => tracing::error!(error = %e, "capability server startup task panicked"),
        }
    }

    connected.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, client) in connected {
        registry.add_client(Arc::new(client)).await;
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    failures
}
