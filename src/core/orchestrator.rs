//! Agent 编排器：可中断的主控循环
//!
//! idle → model_turn →（无调用）responding → idle
//!                   →（有调用）dispatch → executing → model_turn …
//!                                      → awaiting_approval：写检查点后直接返回
//!
//! 审批等待不在进程内挂起：resume 从检查点重建 ConversationState 再继续。
//! 同一模型轮次的多个调用按请求顺序串行执行；遇到第一个敏感调用即挂起，其后的调用进入 queued_calls。
//! 能力调用失败不会中止对话，而是作为 tool 消息折叠进历史，由模型决定下一步。

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, Resolution, REJECTION_MESSAGE};
use crate::capability::CapabilityRegistry;
use crate::checkpoint::Checkpointer;
use crate::config::AppConfig;
use crate::core::{
    AgentError, AgentPhase, ConversationState, ConversationStatus, ThreadGuard,
};
use crate::llm::{
    create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient, RetryConfig,
    RetryingLlmClient,
};
use crate::memory::{Message, ToolCall};

const STEP_LIMIT_MESSAGE: &str =
    "I stopped working on this request because it reached the maximum number of steps. \
     Please narrow the request or continue in a new message.";

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / DeepSeek / Mock），外层加重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.timeouts.request;

    let inner: Arc<dyn LlmClient> = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM (configured)");
            return Arc::new(MockLlmClient);
        }
        "deepseek" => match std::env::var("DEEPSEEK_API_KEY") {
            Ok(key) => {
                tracing::info!("Using DeepSeek LLM");
                Arc::new(create_deepseek_client(None, &key, timeout))
            }
            Err(_) => {
                tracing::warn!("DEEPSEEK_API_KEY not set, using Mock LLM");
                return Arc::new(MockLlmClient);
            }
        },
        _ => match std::env::var("OPENAI_API_KEY") {
            Ok(key) => {
                tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
                Arc::new(OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    &key,
                    timeout,
                ))
            }
            Err(_) => {
                tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
                return Arc::new(MockLlmClient);
            }
        },
    };
    Arc::new(RetryingLlmClient::new(inner, RetryConfig::default()))
}

/// chat / resume 的返回
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub response: String,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
}

impl TurnOutcome {
    fn finished(thread_id: &str, response: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            response: response.into(),
            requires_approval: false,
            approval: None,
        }
    }

    fn suspended(thread_id: &str, request: ApprovalRequest) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            response: request.description(),
            requires_approval: true,
            approval: Some(request),
        }
    }
}

/// 编排器：持有 LLM、能力注册表、审批门与检查点存储；每个线程的状态只在检查点中
pub struct AgentOrchestrator {
    llm: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
    gate: ApprovalGate,
    checkpointer: Arc<dyn Checkpointer>,
    guard: ThreadGuard,
    system_prompt: Option<String>,
    max_model_turns: usize,
}

impl AgentOrchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            llm,
            registry,
            gate: ApprovalGate,
            checkpointer,
            guard: ThreadGuard::new(),
            system_prompt: None,
            max_model_turns: 25,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 单次 chat / resume 内模型轮次上限
    pub fn with_max_model_turns(mut self, turns: usize) -> Self {
        self.max_model_turns = turns.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// 追加用户消息并运行到完成或挂起
    pub async fn chat(&self, thread_id: &str, message: &str) -> Result<TurnOutcome, AgentError> {
        let _permit = self.guard.acquire(thread_id)?;
        let mut state = self
            .checkpointer
            .load(thread_id)
            .await?
            .unwrap_or_else(|| {
                tracing::info!(thread_id, "starting new conversation");
                ConversationState::new(thread_id)
            });

        if state.status == ConversationStatus::AwaitingApproval {
            return Err(AgentError::AwaitingApproval(thread_id.to_string()));
        }

        state.status = ConversationStatus::Running;
        state.push(Message::user(message));
        self.drive(&mut state, Vec::new()).await
    }

    /// 用审批决定恢复一个挂起的对话
    pub async fn resume(
        &self,
        thread_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<TurnOutcome, AgentError> {
        let _permit = self.guard.acquire(thread_id)?;
        let mut state = self
            .checkpointer
            .load(thread_id)
            .await?
            .ok_or_else(|| AgentError::ConversationNotFound(thread_id.to_string()))?;

        match self.gate.resolve(&mut state, request_id, decision)? {
            Resolution::Revised(request) => {
                self.checkpointer.save(&state).await?;
                return Ok(TurnOutcome::suspended(thread_id, request));
            }
            Resolution::Execute(call) => {
                // 先落盘决定，保证同一请求最多执行一次
                self.checkpointer.save(&state).await?;
                self.log_phase(thread_id, AgentPhase::Executing);
                let content = self.execute(&call).await;
                state.push(Message::tool_result(&call, content));
            }
            Resolution::Cancel(call) => {
                tracing::info!(thread_id, capability = %call.name, "sensitive call rejected, not executed");
                state.push(Message::tool_result(&call, REJECTION_MESSAGE));
            }
        }

        let queued = std::mem::take(&mut state.queued_calls);
        self.drive(&mut state, queued).await
    }

    /// 只读快照
    pub async fn snapshot(&self, thread_id: &str) -> Result<ConversationState, AgentError> {
        self.checkpointer
            .load(thread_id)
            .await?
            .ok_or_else(|| AgentError::ConversationNotFound(thread_id.to_string()))
    }

    /// 运行循环并在结束（完成 / 挂起 / 失败）时写检查点
    async fn drive(
        &self,
        state: &mut ConversationState,
        queued: Vec<ToolCall>,
    ) -> Result<TurnOutcome, AgentError> {
        match self.run(state, queued.into()).await {
            Ok(outcome) => {
                self.checkpointer.save(state).await?;
                self.log_phase(&state.thread_id, AgentPhase::Idle);
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(thread_id = %state.thread_id, error = %e, "conversation turn failed");
                state.status = ConversationStatus::Failed;
                state.touch();
                if let Err(save_err) = self.checkpointer.save(state).await {
                    tracing::error!(thread_id = %state.thread_id, error = %save_err, "failed to checkpoint failed conversation");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        state: &mut ConversationState,
        mut queue: VecDeque<ToolCall>,
    ) -> Result<TurnOutcome, AgentError> {
        let thread_id = state.thread_id.clone();
        let mut turns = 0;
        loop {
            while let Some(call) = queue.pop_front() {
                if self.registry.is_sensitive(&call.name) {
                    self.log_phase(&thread_id, AgentPhase::AwaitingApproval);
                    let request = self.gate.request(state, call)?;
                    state.queued_calls = queue.into_iter().collect();
                    return Ok(TurnOutcome::suspended(&thread_id, request));
                }
                self.log_phase(&thread_id, AgentPhase::Executing);
                let content = self.execute(&call).await;
                state.push(Message::tool_result(&call, content));
            }

            if turns >= self.max_model_turns {
                tracing::warn!(thread_id = %thread_id, turns, "model turn limit reached");
                state.push(Message::assistant(STEP_LIMIT_MESSAGE));
                state.status = ConversationStatus::Completed;
                return Ok(TurnOutcome::finished(&thread_id, STEP_LIMIT_MESSAGE));
            }
            turns += 1;

            self.log_phase(&thread_id, AgentPhase::ModelTurn);
            let tools = self.registry.tool_definitions().await;
            let completion = self.llm.complete(&self.prompt(state), &tools).await?;

            if !completion.requests_tools() {
                self.log_phase(&thread_id, AgentPhase::Responding);
                state.push(Message::assistant(completion.content.clone()));
                state.status = ConversationStatus::Completed;
                return Ok(TurnOutcome::finished(&thread_id, completion.content));
            }

            self.log_phase(&thread_id, AgentPhase::Dispatch);
            let calls: Vec<ToolCall> = completion
                .tool_calls
                .into_iter()
                .map(|proposed| ToolCall::new(state.next_call_id(), proposed.name, proposed.arguments))
                .collect();
            state.push(Message::assistant_with_calls(completion.content, calls.clone()));
            queue.extend(calls);
        }
    }

    /// 执行一次调用；错误折叠为自然语言描述
    async fn execute(&self, call: &ToolCall) -> String {
        match self.registry.invoke(call).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(capability = %call.name, call_id = %call.id, error = %e, "capability call failed");
                e.observation(&call.name)
            }
        }
    }

    fn prompt(&self, state: &ConversationState) -> Vec<Message> {
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(state.messages.iter().cloned());
        messages
    }

    fn log_phase(&self, thread_id: &str, phase: AgentPhase) {
        tracing::debug!(thread_id, phase = phase.as_str(), "phase");
    }
}
