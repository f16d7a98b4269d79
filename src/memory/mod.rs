//! 记忆层：对话消息模型

pub mod conversation;

pub use conversation::{Message, Role, ToolCall};
