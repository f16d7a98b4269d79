//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：用户消息中出现某个能力的完整名称时调用它，收到 tool 结果后总结回复，否则回显。
//! - ScriptedLlmClient：按顺序返回预设 Completion，并记录每次收到的消息，供编排器测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{Completion, LlmClient, LlmError, ProposedCall, ToolDefinition};
use crate::memory::{Message, Role};

/// Mock 客户端：按能力名匹配用户输入
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError> {
        let Some(last) = messages.iter().rev().find(|m| m.role != Role::System) else {
            return Ok(Completion::text("(no input)"));
        };

        if last.role == Role::Tool {
            let results: Vec<String> = messages
                .iter()
                .rev()
                .take_while(|m| m.role == Role::Tool)
                .map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Ok(Completion::text(format!(
                "Here is what I found:\n{}",
                results.join("\n")
            )));
        }

        let text = last.content.to_lowercase();
        if let Some(tool) = tools.iter().find(|t| text.contains(&t.name.to_lowercase())) {
            return Ok(Completion::calls(vec![ProposedCall::new(
                tool.name.clone(),
                json!({ "input": last.content }),
            )]));
        }

        Ok(Completion::text(format!("Echo from Mock: {}", last.content)))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// 预设脚本客户端：脚本耗尽后返回固定文本
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: impl IntoIterator<Item = Completion>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 追加一步（可为错误）
    pub fn push(&self, step: Result<Completion, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    /// 每次 complete 收到的消息（不含 system）
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(
                messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .cloned()
                    .collect(),
            );
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::text("(script exhausted)")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn test_mock_calls_named_tool() {
        let out = MockLlmClient
            .complete(
                &[Message::user("please run server_x_sensitive_call now")],
                &[tool("server_x_echo"), tool("server_x_sensitive_call")],
            )
            .await
            .unwrap();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "server_x_sensitive_call");
    }

    #[tokio::test]
    async fn test_mock_summarises_tool_results() {
        let call = ToolCall::new("call_1", "server_x_echo", Default::default());
        let history = vec![
            Message::user("server_x_echo"),
            Message::assistant_with_calls("", vec![call.clone()]),
            Message::tool_result(&call, "pong"),
        ];
        let out = MockLlmClient.complete(&history, &[]).await.unwrap();
        assert!(!out.requests_tools());
        assert!(out.content.contains("pong"));
    }

    #[tokio::test]
    async fn test_scripted_records_and_exhausts() {
        let llm = ScriptedLlmClient::new(vec![Completion::text("first")]);
        let a = llm.complete(&[Message::system("sys"), Message::user("hi")], &[]).await.unwrap();
        let b = llm.complete(&[], &[]).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "(script exhausted)");
        assert_eq!(llm.calls(), 2);
        assert_eq!(llm.seen()[0].len(), 1);
    }
}
