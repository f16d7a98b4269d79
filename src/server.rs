//! 对话 HTTP 接口（axum）
//!
//! POST /chat、POST /approve-action、GET /conversation/:thread_id、GET /health、GET /capabilities。
//! 审批挂起时 /chat 返回 requires_approval=true 与 approval_details，调用方再用 /approve-action 恢复。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::approval::{ApprovalDecision, ApprovalRequest};
use crate::capability::{CapabilityInfo, CapabilityRegistry, ConnectionState, ServerStatus};
use crate::checkpoint::Checkpointer;
use crate::commands::handle_command;
use crate::config::AppConfig;
use crate::core::{AgentError, AgentOrchestrator, ApprovalError, ConversationState, TurnOutcome};

pub struct AppState {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub registry: Arc<CapabilityRegistry>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(orchestrator: Arc<AgentOrchestrator>, config: AppConfig) -> Self {
        Self {
            registry: Arc::clone(orchestrator.registry()),
            checkpointer: Arc::clone(orchestrator.checkpointer()),
            orchestrator,
            config,
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    thread_id: String,
    request_id: String,
    decision: String,
    #[serde(default)]
    edited_arguments: Option<Map<String, Value>>,
}

/// 待审批调用的展示信息
#[derive(Debug, Serialize)]
struct ApprovalDetails {
    request_id: String,
    capability: String,
    arguments: Map<String, Value>,
    description: String,
}

impl From<&ApprovalRequest> for ApprovalDetails {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            capability: request.capability().to_string(),
            arguments: request.arguments().clone(),
            description: request.description(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    thread_id: String,
    response: String,
    requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    approval_details: Option<ApprovalDetails>,
}

impl From<TurnOutcome> for ChatResponse {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            approval_details: outcome.approval.as_ref().map(ApprovalDetails::from),
            thread_id: outcome.thread_id,
            response: outcome.response,
            requires_approval: outcome.requires_approval,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    components: Value,
}

/// 构建路由（测试直接用 oneshot 驱动）
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/approve-action", post(approve_action))
        .route("/conversation/:thread_id", get(conversation))
        .route("/health", get(health))
        .route("/capabilities", get(capabilities))
        .with_state(state)
}

fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::ThreadBusy(_) | AgentError::AwaitingApproval(_) => StatusCode::CONFLICT,
        AgentError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        AgentError::Approval(e) => match e {
            ApprovalError::UnknownRequest(_) => StatusCode::NOT_FOUND,
            ApprovalError::MissingEditedArguments | ApprovalError::InvalidDecision(_) => {
                StatusCode::BAD_REQUEST
            }
            ApprovalError::AlreadyPending(_)
            | ApprovalError::AlreadyResolved(_)
            | ApprovalError::SingleRevision(_) => StatusCode::CONFLICT,
        },
        AgentError::Llm(_) => StatusCode::BAD_GATEWAY,
        AgentError::Checkpoint(_) | AgentError::ConfigError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: AgentError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    (status, Json(json!({ "error": err.to_string() })))
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let thread_id = req
        .thread_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("thread-{}", uuid::Uuid::new_v4()));
    let message = req.message.trim();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    if let Some(reply) = handle_command(message, &state.registry).await {
        return Ok(Json(ChatResponse {
            thread_id,
            response: reply,
            requires_approval: false,
            approval_details: None,
        }));
    }

    let outcome = state
        .orchestrator
        .chat(&thread_id, message)
        .await
        .map_err(api_error)?;
    Ok(Json(outcome.into()))
}

async fn approve_action(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let decision = ApprovalDecision::parse(&req.decision, req.edited_arguments)
        .map_err(|e| api_error(e.into()))?;
    tracing::info!(
        thread_id = %req.thread_id,
        request_id = %req.request_id,
        decision = %req.decision,
        "approval decision received"
    );
    let outcome = state
        .orchestrator
        .resume(&req.thread_id, &req.request_id, decision)
        .await
        .map_err(api_error)?;
    Ok(Json(outcome.into()))
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ConversationState>, ApiError> {
    let snapshot = state
        .orchestrator
        .snapshot(&thread_id)
        .await
        .map_err(api_error)?;
    Ok(Json(snapshot))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let servers = state.registry.servers().await;
    let mut degraded = false;
    let mut server_states = Map::new();
    for (name, entry) in &state.config.servers {
        if !entry.enabled {
            continue;
        }
        let status: Option<&ServerStatus> = servers.iter().find(|s| &s.name == name);
        let current = status.map(|s| s.state.as_str()).unwrap_or("not_connected");
        if status.map(|s| s.state) != Some(ConnectionState::Ready) {
            degraded = true;
        }
        server_states.insert(name.clone(), json!(current));
    }
    // 未出现在配置里的连接（测试或运行时注册）
    for status in &servers {
        if !server_states.contains_key(&status.name) {
            if status.state != ConnectionState::Ready {
                degraded = true;
            }
            server_states.insert(status.name.clone(), json!(status.state.as_str()));
        }
    }

    let capability_count = state.registry.list().await.len();
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        components: json!({
            "checkpoint": state.checkpointer.backend(),
            "servers": server_states,
            "capabilities": capability_count,
            "sensitive_capabilities": state.registry.sensitive_capabilities(),
        }),
    })
}

async fn capabilities(State(state): State<Arc<AppState>>) -> Json<Vec<CapabilityInfo>> {
    Json(state.registry.list().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&AgentError::ThreadBusy("t".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ApprovalError::SingleRevision("apr_1".into()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ApprovalError::UnknownRequest("apr_1".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ApprovalError::InvalidDecision("maybe".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AgentError::Llm(LlmError::ApiError("x".into()))),
            StatusCode::BAD_GATEWAY
        );
    }
}
