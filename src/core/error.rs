//! 错误类型
//!
//! 分层：能力调用（CapabilityError）、审批（ApprovalError）、检查点（CheckpointError），
//! 由 AgentError 汇总给对话接口。能力错误不会中止对话，而是通过 observation() 折叠为 tool 消息。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 能力服务器连接与调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// 启动参数引用的环境变量不存在（配置错误，不重试）
    #[error("Missing secret for server '{server}': ${variable} is not set")]
    MissingSecret { server: String, variable: String },

    #[error("Failed to start capability server '{server}': {reason}")]
    Spawn { server: String, reason: String },

    /// 协议版本不兼容（配置错误，不重试）
    #[error("Server '{server}' speaks protocol {offered}, expected one of {expected:?}")]
    VersionMismatch {
        server: String,
        offered: String,
        expected: Vec<String>,
    },

    #[error("Handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    /// 连接已降级或关闭
    #[error("Capability server '{0}' is unavailable")]
    Unavailable(String),

    #[error("Capability '{capability}' timed out after {}s", .after.as_secs())]
    Timeout { capability: String, after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// 服务器返回 isError 或本地能力执行失败
    #[error("Capability failed: {0}")]
    Failed(String),

    /// 连接关闭时未完成的请求
    #[error("Request cancelled: connection to '{0}' closed")]
    Cancelled(String),

    #[error("Unknown capability: {0}")]
    NotFound(String),
}

impl CapabilityError {
    /// 配置类错误：启动时致命，不重试
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CapabilityError::MissingSecret { .. } | CapabilityError::VersionMismatch { .. }
        )
    }

    /// 折叠进对话的自然语言描述（不暴露原始协议细节）
    pub fn observation(&self, capability: &str) -> String {
        match self {
            CapabilityError::Timeout { after, .. } => format!(
                "The capability '{}' timed out after {} seconds and returned no result. \
                 It may still be running remotely.",
                capability,
                after.as_secs()
            ),
            CapabilityError::Unavailable(_) | CapabilityError::Cancelled(_) => format!(
                "The capability '{}' is currently unavailable because its server connection was lost.",
                capability
            ),
            CapabilityError::NotFound(_) => format!(
                "There is no capability named '{}'. Choose one of the available capabilities.",
                capability
            ),
            CapabilityError::Failed(reason) => {
                format!("The capability '{}' reported an error: {}", capability, reason)
            }
            CapabilityError::Remote { message, .. } => {
                format!("The capability '{}' reported an error: {}", capability, message)
            }
            CapabilityError::Protocol(_) => format!(
                "The capability '{}' returned a response that could not be understood.",
                capability
            ),
            CapabilityError::MissingSecret { .. }
            | CapabilityError::Spawn { .. }
            | CapabilityError::VersionMismatch { .. }
            | CapabilityError::Handshake { .. } => format!(
                "The capability '{}' could not be reached due to a server configuration problem.",
                capability
            ),
        }
    }

    /// 审计日志中的结果标签
    pub fn outcome(&self) -> &'static str {
        match self {
            CapabilityError::Timeout { .. } => "timeout",
            CapabilityError::Unavailable(_) | CapabilityError::Cancelled(_) => "unavailable",
            CapabilityError::NotFound(_) => "not_found",
            _ => "error",
        }
    }
}

/// 审批流程错误：调用方收到明确错误，对话状态保持不变
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval request {0} is already pending for this conversation")]
    AlreadyPending(String),

    #[error("Unknown approval request: {0}")]
    UnknownRequest(String),

    #[error("Approval request {0} is already resolved")]
    AlreadyResolved(String),

    /// 每个请求只允许一次编辑
    #[error("Approval request {0} was already revised once (single revision allowed)")]
    SingleRevision(String),

    #[error("Edit decision requires edited_arguments")]
    MissingEditedArguments,

    #[error("Unknown decision '{0}' (expected approve, reject or edit)")]
    InvalidDecision(String),
}

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint database error: {0}")]
    Database(String),
}

/// 对话接口汇总错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 同一线程已有请求在处理中（不交错执行）
    #[error("Thread {0} is busy with another request")]
    ThreadBusy(String),

    #[error("Thread {0} is awaiting approval; resolve it before sending new messages")]
    AwaitingApproval(String),

    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Config error: {0}")]
    ConfigError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_observation_mentions_timeout() {
        let err = CapabilityError::Timeout {
            capability: "x_slow".into(),
            after: Duration::from_secs(30),
        };
        let text = err.observation("x_slow");
        assert!(text.contains("timed out after 30 seconds"));
        assert_eq!(err.outcome(), "timeout");
    }

    #[test]
    fn test_protocol_detail_not_exposed() {
        let err = CapabilityError::Protocol("unexpected id 99 in {\"jsonrpc\":...}".into());
        let text = err.observation("x_query");
        assert!(!text.contains("jsonrpc"));
        assert!(!text.contains("99"));
    }

    #[test]
    fn test_configuration_errors() {
        assert!(CapabilityError::MissingSecret {
            server: "splunk".into(),
            variable: "SPLUNK_TOKEN".into()
        }
        .is_configuration());
        assert!(!CapabilityError::Unavailable("splunk".into()).is_configuration());
    }
}
