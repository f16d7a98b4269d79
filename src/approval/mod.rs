//! 人工审批门
//!
//! 敏感能力（由 CapabilityRegistry 判定）不直接执行：request 在对话状态中登记一个待审批请求，
//! 编排器随即写检查点并返回；之后独立的 resolve 调用带着决定恢复。
//! 每个对话同一时刻至多一个待审批请求；每个请求只允许编辑一次。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{ApprovalError, ConversationState, ConversationStatus};
use crate::memory::ToolCall;

/// 拒绝后折叠进对话的 tool 结果
pub const REJECTION_MESSAGE: &str = "The requested operation was rejected by human review.";

/// 审批请求的决定状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Edited,
}

/// 一次待审批的能力调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_call: ToolCall,
    pub state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_arguments: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    fn new(tool_call: ToolCall) -> Self {
        Self {
            id: format!("apr_{}", uuid::Uuid::new_v4().simple()),
            tool_call,
            state: ApprovalState::Pending,
            edited_arguments: None,
            created_at: Utc::now(),
        }
    }

    pub fn capability(&self) -> &str {
        &self.tool_call.name
    }

    /// 当前将要执行的参数（编辑过则为编辑后的）
    pub fn arguments(&self) -> &Map<String, Value> {
        self.edited_arguments
            .as_ref()
            .unwrap_or(&self.tool_call.arguments)
    }

    /// 批准后实际执行的调用（沿用原调用 ID）
    pub fn effective_call(&self) -> ToolCall {
        self.tool_call.with_arguments(self.arguments().clone())
    }

    pub fn description(&self) -> String {
        format!(
            "Approval required to run '{}' with arguments {}",
            self.tool_call.name,
            Value::Object(self.arguments().clone())
        )
    }
}

/// 审批决定
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Edit(Map<String, Value>),
}

impl ApprovalDecision {
    /// 解析接口传入的 decision 字符串
    pub fn parse(
        decision: &str,
        edited_arguments: Option<Map<String, Value>>,
    ) -> Result<Self, ApprovalError> {
        match decision.trim().to_lowercase().as_str() {
            "approve" | "approved" => Ok(ApprovalDecision::Approve),
            "reject" | "rejected" => Ok(ApprovalDecision::Reject),
            "edit" | "edited" => edited_arguments
                .map(ApprovalDecision::Edit)
                .ok_or(ApprovalError::MissingEditedArguments),
            other => Err(ApprovalError::InvalidDecision(other.to_string())),
        }
    }
}

/// resolve 的结果，由编排器执行
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// 批准：执行该调用
    Execute(ToolCall),
    /// 拒绝：折叠拒绝消息，不执行
    Cancel(ToolCall),
    /// 编辑：参数已替换，仍等待 approve / reject
    Revised(ApprovalRequest),
}

/// 审批门：只负责待审批请求的状态转换，是否敏感由能力注册表决定
#[derive(Debug, Clone, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    /// 登记待审批请求，对话进入 awaiting_approval
    pub fn request(
        &self,
        state: &mut ConversationState,
        call: ToolCall,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if let Some(pending) = &state.pending_approval {
            return Err(ApprovalError::AlreadyPending(pending.id.clone()));
        }
        let request = ApprovalRequest::new(call);
        tracing::info!(
            thread_id = %state.thread_id,
            request_id = %request.id,
            capability = %request.tool_call.name,
            "approval requested"
        );
        state.pending_approval = Some(request.clone());
        state.status = ConversationStatus::AwaitingApproval;
        state.touch();
        Ok(request)
    }

    /// 处理决定；出错时 state 保持不变
    pub fn resolve(
        &self,
        state: &mut ConversationState,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<Resolution, ApprovalError> {
        if state.resolved_approvals.contains(request_id) {
            return Err(ApprovalError::AlreadyResolved(request_id.to_string()));
        }
        let pending = match &mut state.pending_approval {
            Some(p) if p.id == request_id => p,
            _ => return Err(ApprovalError::UnknownRequest(request_id.to_string())),
        };

        let resolution = match decision {
            ApprovalDecision::Edit(arguments) => {
                if pending.state == ApprovalState::Edited {
                    return Err(ApprovalError::SingleRevision(request_id.to_string()));
                }
                pending.edited_arguments = Some(arguments);
                pending.state = ApprovalState::Edited;
                tracing::info!(thread_id = %state.thread_id, request_id, "approval arguments edited");
                let revised = pending.clone();
                state.touch();
                return Ok(Resolution::Revised(revised));
            }
            ApprovalDecision::Approve => {
                pending.state = ApprovalState::Approved;
                Resolution::Execute(pending.effective_call())
            }
            ApprovalDecision::Reject => {
                pending.state = ApprovalState::Rejected;
                Resolution::Cancel(pending.tool_call.clone())
            }
        };

        tracing::info!(
            thread_id = %state.thread_id,
            request_id,
            decision = if matches!(resolution, Resolution::Execute(_)) { "approve" } else { "reject" },
            "approval resolved"
        );
        state.pending_approval = None;
        state.resolved_approvals.insert(request_id.to_string());
        state.status = ConversationStatus::Running;
        state.touch();
        Ok(resolution)
    }
}
