//! 测试替身：记录调用的内存能力服务器（单元测试与集成测试共用）

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::capability::client::ConnectionState;
use crate::capability::protocol::{empty_schema, CapabilityDescriptor};
use crate::capability::registry::CapabilityBackend;
use crate::core::CapabilityError;

/// 记录每次调用的假连接；可设定状态、延迟与预设结果
pub struct SpyBackend {
    name: String,
    capabilities: Vec<CapabilityDescriptor>,
    state: Mutex<ConnectionState>,
    invocations: Mutex<Vec<(String, Map<String, Value>)>>,
    responses: Mutex<HashMap<String, Result<String, CapabilityError>>>,
    delay: Mutex<Option<Duration>>,
}

impl SpyBackend {
    pub fn new(name: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities
                .iter()
                .map(|c| CapabilityDescriptor {
                    name: c.to_string(),
                    description: format!("{} on {}", c, name),
                    input_schema: empty_schema(),
                })
                .collect(),
            state: Mutex::new(ConnectionState::Ready),
            invocations: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// 预设某能力的返回
    pub fn respond(&self, capability: &str, result: Result<String, CapabilityError>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(capability.to_string(), result);
    }

    /// 每次调用前等待；超过调用超时则按超时返回
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// 收到的调用（原始能力名, 参数）
    pub fn invocations(&self) -> Vec<(String, Map<String, Value>)> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CapabilityBackend for SpyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities.clone()
    }

    async fn invoke(
        &self,
        capability: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, CapabilityError> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((capability.to_string(), arguments.clone()));

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(CapabilityError::Timeout {
                    capability: capability.to_string(),
                    after: timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(capability)
            .cloned();
        scripted.unwrap_or_else(|| {
            Ok(format!(
                "{} ok: {}",
                capability,
                Value::Object(arguments.clone())
            ))
        })
    }

    async fn shutdown(&self) {
        self.set_state(ConnectionState::Closed);
    }
}
