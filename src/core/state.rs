//! 状态定义：ConversationState（检查点的内容）与 AgentPhase（编排器阶段，仅用于日志）
//!
//! ConversationState 只由持有该线程的编排器修改；挂起（等待审批）、完成、失败时写检查点。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalRequest;
use crate::memory::{Message, ToolCall};

/// 对话状态标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

/// 一个线程的完整对话状态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationState {
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    /// 等待中的审批（同一时刻至多一个）
    #[serde(default)]
    pub pending_approval: Option<ApprovalRequest>,
    /// 同一模型轮次中排在被挂起调用之后、尚未执行的调用
    #[serde(default)]
    pub queued_calls: Vec<ToolCall>,
    /// 已处理过的审批请求 ID
    #[serde(default)]
    pub resolved_approvals: BTreeSet<String>,
    #[serde(default)]
    pub next_call_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            status: ConversationStatus::Running,
            pending_approval: None,
            queued_calls: Vec::new(),
            resolved_approvals: BTreeSet::new(),
            next_call_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 对话内唯一的调用 ID
    pub fn next_call_id(&mut self) -> String {
        self.next_call_seq += 1;
        format!("call_{}", self.next_call_seq)
    }

    /// 每个能力调用请求恰好对应一条 tool 消息（挂起期间被挂起与排队的调用除外）
    pub fn unanswered_calls(&self) -> Vec<&ToolCall> {
        let answered: BTreeSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }
}

/// 编排器阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    ModelTurn,
    Dispatch,
    Executing,
    AwaitingApproval,
    Responding,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::ModelTurn => "model_turn",
            AgentPhase::Dispatch => "dispatch",
            AgentPhase::Executing => "executing",
            AgentPhase::AwaitingApproval => "awaiting_approval",
            AgentPhase::Responding => "responding",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_unique() {
        let mut state = ConversationState::new("t1");
        assert_eq!(state.next_call_id(), "call_1");
        assert_eq!(state.next_call_id(), "call_2");
    }

    #[test]
    fn test_serde_round_trip_keeps_status() {
        let mut state = ConversationState::new("t1");
        state.status = ConversationStatus::AwaitingApproval;
        state.push(Message::user("hi"));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"awaiting_approval\""));
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ConversationStatus::AwaitingApproval);
        assert_eq!(back.messages, state.messages);
    }

    #[test]
    fn test_unanswered_calls() {
        let mut state = ConversationState::new("t1");
        let a = ToolCall::new("call_1", "x_a", Default::default());
        let b = ToolCall::new("call_2", "x_b", Default::default());
        state.push(Message::assistant_with_calls("", vec![a.clone(), b.clone()]));
        state.push(Message::tool_result(&a, "done"));
        let open: Vec<_> = state.unanswered_calls().into_iter().map(|c| c.id.clone()).collect();
        assert_eq!(open, vec!["call_2"]);
    }
}
