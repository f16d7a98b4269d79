//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url，function calling 格式）；支持 OpenAI、DeepSeek、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionResponseMessage, ChatCompletionTool,
    ChatCompletionTools, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FunctionCall, FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::llm::{Completion, LlmClient, LlmError, ProposedCall, ToolDefinition};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message / ToolDefinition 为 API 格式
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout_secs: u64) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(timeout_secs),
            usage: TokenUsage::default(),
        }
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(to_openai_messages(messages)?)
            .temperature(0.0);
        if !tools.is_empty() {
            args.tools(to_openai_tools(tools));
        }
        args.build().map_err(invalid)
    }
}

fn invalid(e: impl std::fmt::Display) -> LlmError {
    LlmError::InvalidResponse(e.to_string())
}

/// Message -> ChatCompletionRequestMessage（assistant 携带 tool_calls，tool 携带 tool_call_id）
fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let message = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::Assistant => {
                    let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                    if !m.content.is_empty() || m.tool_calls.is_empty() {
                        args.content(m.content.clone());
                    }
                    if !m.tool_calls.is_empty() {
                        args.tool_calls(
                            m.tool_calls
                                .iter()
                                .map(|c| {
                                    ChatCompletionMessageToolCalls::Function(
                                        ChatCompletionMessageToolCall {
                                            id: c.id.clone(),
                                            function: FunctionCall {
                                                name: c.name.clone(),
                                                arguments: Value::Object(c.arguments.clone())
                                                    .to_string(),
                                            },
                                        },
                                    )
                                })
                                .collect::<Vec<_>>(),
                        );
                    }
                    ChatCompletionRequestMessage::Assistant(args.build().map_err(invalid)?)
                }
                Role::Tool => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
            };
            Ok(message)
        })
        .collect()
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Vec<ChatCompletionTools> {
    tools
        .iter()
        .map(|t| {
            ChatCompletionTools::Function(ChatCompletionTool {
                function: FunctionObject {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: Some(t.parameters.clone()),
                    strict: None,
                },
            })
        })
        .collect()
}

/// 首条 choice 的 message -> Completion；arguments 必须是 JSON 对象
fn to_completion(message: ChatCompletionResponseMessage) -> Result<Completion, LlmError> {
    let mut tool_calls = Vec::new();
    for call in message.tool_calls.unwrap_or_default() {
        let ChatCompletionMessageToolCalls::Function(call) = call else {
            return Err(LlmError::InvalidResponse("unsupported custom tool call".into()));
        };
        let raw = call.function.arguments.trim();
        let arguments: Map<String, Value> = if raw.is_empty() {
            Map::new()
        } else {
            serde_json::from_str(raw).map_err(|e| {
                LlmError::InvalidResponse(format!(
                    "arguments for {} are not a JSON object: {}",
                    call.function.name, e
                ))
            })?
        };
        tool_calls.push(ProposedCall {
            id: Some(call.id),
            name: call.function.name,
            arguments,
        });
    }

    Ok(Completion {
        content: message.content.unwrap_or_default(),
        tool_calls,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError> {
        let request = self.build_request(messages, tools)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".into()))?;
        to_completion(choice.message)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;
    use serde_json::json;

    fn response_message(value: Value) -> ChatCompletionResponseMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_tool_calls() {
        let message = response_message(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_abc",
                "type": "function",
                "function": {"name": "splunk_run_query", "arguments": "{\"query\":\"index=main\"}"}
            }]
        }));
        let out = to_completion(message).unwrap();
        assert_eq!(out.content, "");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(out.tool_calls[0].arguments["query"], "index=main");
    }

    #[test]
    fn test_parse_rejects_non_object_arguments() {
        let message = response_message(json!({
            "role": "assistant",
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {"name": "x", "arguments": "[1,2]"}
            }]
        }));
        assert!(matches!(to_completion(message), Err(LlmError::InvalidResponse(_))));
    }

    #[test]
    fn test_request_carries_tool_history() {
        let client = OpenAiClient::new(None, "gpt-4o", "sk-test", 5);
        let call = ToolCall::new("call_1", "x_echo", Map::new());
        let messages = vec![
            Message::user("hi"),
            Message::assistant_with_calls("", vec![call.clone()]),
            Message::tool_result(&call, "done"),
        ];
        let request = client.build_request(&messages, &[]).unwrap();
        let wire = serde_json::to_value(&request).unwrap();

        assert_eq!(wire["model"], "gpt-4o");
        assert!(wire.get("tools").is_none());
        assert_eq!(wire["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire["messages"][1]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(wire["messages"][2]["role"], "tool");
        assert_eq!(wire["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_request_declares_function_tools() {
        let client = OpenAiClient::new(Some("https://api.deepseek.com/"), "deepseek-chat", "sk-test", 5);
        let tools = vec![ToolDefinition {
            name: "server_x_echo".into(),
            description: "Echo text".into(),
            parameters: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        }];
        let request = client.build_request(&[Message::user("hi")], &tools).unwrap();
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["tools"][0]["type"], "function");
        assert_eq!(wire["tools"][0]["function"]["name"], "server_x_echo");
        assert_eq!(
            wire["tools"][0]["function"]["parameters"]["properties"]["text"]["type"],
            "string"
        );
    }
}
