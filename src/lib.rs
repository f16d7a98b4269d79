//! Gatekeeper - 带人工审批的智能体编排服务
//!
//! 模块划分：
//! - **approval**: 人工审批门（敏感能力挂起、approve / reject / 单次 edit）
//! - **capability**: 能力服务器协议与子进程客户端、能力注册表、知识库检索能力
//! - **checkpoint**: 对话检查点（内存 / JSON 文件 / SQLite）
//! - **commands**: 斜杠命令（/help、/tools、/servers）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、对话状态、线程守卫、编排器、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话消息与工具调用
//! - **observability**: tracing 初始化
//! - **server**: HTTP 对话接口（feature `web`）

pub mod approval;
pub mod capability;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
#[cfg(feature = "web")]
pub mod server;

pub use core::{AgentError, AgentOrchestrator, TurnOutcome};
