//! 能力注册表
//!
//! 远程能力来自各 CapabilityBackend（能力服务器连接），以 `{server}_{capability}` 命名；
//! 本地能力实现 LocalCapability（如检索），直接以自身名称注册。名称冲突时先注册者保留。
//! invoke 施加超时并输出结构化审计日志（JSON），失败统一为 CapabilityError。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::capability::client::ConnectionState;
use crate::capability::protocol::CapabilityDescriptor;
use crate::core::CapabilityError;
use crate::llm::ToolDefinition;
use crate::memory::ToolCall;

/// 能力服务器连接（真实子进程客户端或测试替身）
#[async_trait]
pub trait CapabilityBackend: Send + Sync {
    /// 服务器名（能力名前缀）
    fn name(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// 握手时列出的能力
    fn capabilities(&self) -> Vec<CapabilityDescriptor>;

    /// 调用远程能力（capability 为服务器内的原始名称）
    async fn invoke(
        &self,
        capability: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, CapabilityError>;

    async fn shutdown(&self);
}

/// 进程内能力：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait LocalCapability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 能力的实际提供者
#[derive(Clone)]
pub enum Provider {
    Remote {
        client: Arc<dyn CapabilityBackend>,
        capability: String,
    },
    Local(Arc<dyn LocalCapability>),
}

/// 注册表中的一项能力
#[derive(Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub argument_schema: Value,
    pub provider: Provider,
    pub sensitive: bool,
}

impl Capability {
    /// 所属服务器（本地能力为 None）
    pub fn server(&self) -> Option<&str> {
        match &self.provider {
            Provider::Remote { client, .. } => Some(client.name()),
            Provider::Local(_) => None,
        }
    }

    /// 所属连接处于 ready（本地能力总是可用）
    pub fn is_available(&self) -> bool {
        match &self.provider {
            Provider::Remote { client, .. } => client.state() == ConnectionState::Ready,
            Provider::Local(_) => true,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.argument_schema.clone(),
        }
    }
}

/// 对外展示的能力信息（/capabilities、/tools）
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
    /// 服务器名或 "local"
    pub provider: String,
    pub sensitive: bool,
    pub available: bool,
}

/// 对外展示的服务器状态（/health、/servers）
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub capabilities: usize,
}

#[derive(Default)]
struct Inner {
    capabilities: BTreeMap<String, Capability>,
    clients: BTreeMap<String, Arc<dyn CapabilityBackend>>,
}

/// 能力注册表：统一的限定名 → 提供者映射
pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
    sensitive: HashSet<String>,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(invocation_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            sensitive: HashSet::new(),
            timeout: invocation_timeout,
        }
    }

    /// 标记敏感能力（完整名称）
    pub fn with_sensitive(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.sensitive.extend(names);
        self
    }

    pub fn invocation_timeout(&self) -> Duration {
        self.timeout
    }

    /// 是否需要人工审批（按完整名称判定，未注册的名称同样适用）
    pub fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive.contains(name)
    }

    pub fn sensitive_capabilities(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sensitive.iter().cloned().collect();
        names.sort();
        names
    }

    /// 注册本地能力；同名已存在时忽略并返回 false
    pub async fn register_local(&self, capability: impl LocalCapability + 'static) -> bool {
        let capability: Arc<dyn LocalCapability> = Arc::new(capability);
        let name = capability.name().to_string();
        let mut inner = self.inner.write().await;
        if inner.capabilities.contains_key(&name) {
            tracing::warn!(capability = %name, "capability name already registered, keeping the first");
            return false;
        }
        inner.capabilities.insert(
            name.clone(),
            Capability {
                description: capability.description().to_string(),
                argument_schema: capability.parameters_schema(),
                sensitive: self.sensitive.contains(&name),
                name,
                provider: Provider::Local(capability),
            },
        );
        true
    }

    /// 加入一个已握手的连接并注册其全部能力；返回实际注册的限定名
    pub async fn add_client(&self, client: Arc<dyn CapabilityBackend>) -> Vec<String> {
        let server = client.name().to_string();
        let mut inner = self.inner.write().await;
        if inner.clients.contains_key(&server) {
            tracing::warn!(server = %server, "server already registered, ignoring duplicate");
            return Vec::new();
        }

        let mut added = Vec::new();
        for descriptor in client.capabilities() {
            let name = format!("{}_{}", server, descriptor.name);
            if let Some(existing) = inner.capabilities.get(&name) {
                tracing::warn!(
                    capability = %name,
                    kept = existing.server().unwrap_or("local"),
                    ignored = %server,
                    "capability name collision, keeping the first registration"
                );
                continue;
            }
            inner.capabilities.insert(
                name.clone(),
                Capability {
                    description: descriptor.description,
                    argument_schema: descriptor.input_schema,
                    provider: Provider::Remote {
                        client: client.clone(),
                        capability: descriptor.name,
                    },
                    sensitive: self.sensitive.contains(&name),
                    name: name.clone(),
                },
            );
            added.push(name);
        }
        tracing::info!(server = %server, capabilities = added.len(), "registered capability server");
        inner.clients.insert(server, client);
        added
    }

    /// 移除连接及其能力并关闭它（不影响其它连接与进行中的其它调用）
    pub async fn remove_client(&self, server: &str) -> bool {
        let client = {
            let mut inner = self.inner.write().await;
            let Some(client) = inner.clients.remove(server) else {
                return false;
            };
            inner
                .capabilities
                .retain(|_, cap| cap.server() != Some(server));
            client
        };
        client.shutdown().await;
        tracing::info!(server = %server, "removed capability server");
        true
    }

    pub async fn resolve(&self, name: &str) -> Option<Capability> {
        self.inner.read().await.capabilities.get(name).cloned()
    }

    /// 提供给模型的能力：仅包含可用的
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.inner
            .read()
            .await
            .capabilities
            .values()
            .filter(|cap| cap.is_available())
            .map(Capability::definition)
            .collect()
    }

    pub async fn list(&self) -> Vec<CapabilityInfo> {
        self.inner
            .read()
            .await
            .capabilities
            .values()
            .map(|cap| CapabilityInfo {
                name: cap.name.clone(),
                description: cap.description.clone(),
                provider: cap.server().unwrap_or("local").to_string(),
                sensitive: cap.sensitive,
                available: cap.is_available(),
            })
            .collect()
    }

    pub async fn servers(&self) -> Vec<ServerStatus> {
        let inner = self.inner.read().await;
        inner
            .clients
            .iter()
            .map(|(name, client)| ServerStatus {
                name: name.clone(),
                state: client.state(),
                capabilities: inner
                    .capabilities
                    .values()
                    .filter(|cap| cap.server() == Some(name.as_str()))
                    .count(),
            })
            .collect()
    }

    /// 执行一次调用；超时、连接不可用、远程失败均返回 CapabilityError；输出 JSON 审计日志
    pub async fn invoke(&self, call: &ToolCall) -> Result<String, CapabilityError> {
        let start = Instant::now();
        let result = match self.resolve(&call.name).await {
            None => Err(CapabilityError::NotFound(call.name.clone())),
            Some(cap) => self.invoke_capability(&cap, &call.arguments).await,
        };

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.outcome()),
        };
        let audit = serde_json::json!({
            "event": "capability_audit",
            "capability": call.name,
            "call_id": call.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        result
    }

    async fn invoke_capability(
        &self,
        cap: &Capability,
        arguments: &Map<String, Value>,
    ) -> Result<String, CapabilityError> {
        match &cap.provider {
            Provider::Remote { client, capability } => {
                if client.state() != ConnectionState::Ready {
                    return Err(CapabilityError::Unavailable(client.name().to_string()));
                }
                client.invoke(capability, arguments, self.timeout).await
            }
            Provider::Local(local) => {
                match tokio::time::timeout(self.timeout, local.execute(Value::Object(arguments.clone())))
                    .await
                {
                    Ok(Ok(content)) => Ok(content),
                    Ok(Err(e)) => Err(CapabilityError::Failed(e)),
                    Err(_) => Err(CapabilityError::Timeout {
                        capability: cap.name.clone(),
                        after: self.timeout,
                    }),
                }
            }
        }
    }

    /// 关闭所有连接（进程退出时调用）
    pub async fn shutdown_all(&self) {
        let clients: Vec<_> = {
            let mut inner = self.inner.write().await;
            inner.capabilities.retain(|_, cap| cap.server().is_none());
            std::mem::take(&mut inner.clients).into_values().collect()
        };
        for client in clients {
            client.shutdown().await;
        }
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
