//! 编排器 + 审批门 + 检查点的端到端场景（脚本化 LLM + 记录调用的假能力服务器）

use std::sync::Arc;
use std::time::Duration;

use gatekeeper::approval::{ApprovalDecision, ApprovalState, REJECTION_MESSAGE};
use gatekeeper::capability::testing::SpyBackend;
use gatekeeper::capability::CapabilityRegistry;
use gatekeeper::checkpoint::{Checkpointer, FileCheckpointer, MemoryCheckpointer};
use gatekeeper::core::{AgentError, AgentOrchestrator, ApprovalError, ConversationStatus};
use gatekeeper::llm::{Completion, ProposedCall, ScriptedLlmClient};
use gatekeeper::memory::Role;
use serde_json::json;

const SENSITIVE: &str = "server_x_sensitive_call";

struct Harness {
    orchestrator: Arc<AgentOrchestrator>,
    llm: Arc<ScriptedLlmClient>,
    spy: Arc<SpyBackend>,
}

async fn harness_with(
    script: Vec<Completion>,
    sensitive: &[&str],
    timeout: Duration,
    checkpointer: Arc<dyn Checkpointer>,
) -> Harness {
    let llm = Arc::new(ScriptedLlmClient::new(script));
    let registry = Arc::new(
        CapabilityRegistry::new(timeout).with_sensitive(sensitive.iter().map(|s| s.to_string())),
    );
    let spy = Arc::new(SpyBackend::new("server_x", &["sensitive_call", "lookup"]));
    registry.add_client(spy.clone()).await;
    let orchestrator = Arc::new(
        AgentOrchestrator::new(llm.clone(), registry, checkpointer)
            .with_system_prompt("You are a test assistant."),
    );
    Harness {
        orchestrator,
        llm,
        spy,
    }
}

async fn harness(script: Vec<Completion>) -> Harness {
    harness_with(
        script,
        &[SENSITIVE],
        Duration::from_secs(5),
        Arc::new(MemoryCheckpointer::new()),
    )
    .await
}

fn sensitive_then_answer() -> Vec<Completion> {
    vec![
        Completion::calls(vec![ProposedCall::new(
            SENSITIVE,
            json!({ "action": "restart prod" }),
        )]),
        Completion::text("The operation has been handled."),
    ]
}

#[tokio::test]
async fn test_approve_executes_and_folds_result() {
    let h = harness(sensitive_then_answer()).await;

    let out = h.orchestrator.chat("t1", "run a sensitive query").await.unwrap();
    assert!(out.requires_approval);
    let request = out.approval.clone().unwrap();
    assert_eq!(request.capability(), SENSITIVE);
    assert_eq!(request.arguments()["action"], "restart prod");
    assert!(h.spy.invocations().is_empty());

    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(state.status, ConversationStatus::AwaitingApproval);
    assert_eq!(state.pending_approval.as_ref().unwrap().id, request.id);

    let done = h
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    assert!(!done.requires_approval);
    assert_eq!(done.response, "The operation has been handled.");
    assert_eq!(h.spy.invocations().len(), 1);

    // 第二次模型轮次看到了折叠进来的结果
    let second = &h.llm.seen()[1];
    let folded = second.last().unwrap();
    assert_eq!(folded.role, Role::Tool);
    assert!(folded.content.contains("sensitive_call ok"));

    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(state.status, ConversationStatus::Completed);
    assert!(state.pending_approval.is_none());
    assert!(state.resolved_approvals.contains(&request.id));
}

#[tokio::test]
async fn test_reject_never_invokes() {
    let h = harness(sensitive_then_answer()).await;
    let out = h.orchestrator.chat("t1", "do it").await.unwrap();
    let request = out.approval.unwrap();

    let done = h
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Reject)
        .await
        .unwrap();
    assert!(!done.requires_approval);
    assert!(h.spy.invocations().is_empty());

    let second = &h.llm.seen()[1];
    assert_eq!(second.last().unwrap().content, REJECTION_MESSAGE);
}

#[tokio::test]
async fn test_single_edit_then_approve_uses_edited_arguments() {
    let h = harness(sensitive_then_answer()).await;
    let out = h.orchestrator.chat("t1", "do it").await.unwrap();
    let request = out.approval.unwrap();

    let edited = json!({ "action": "restart staging" }).as_object().cloned().unwrap();
    let revised = h
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Edit(edited))
        .await
        .unwrap();
    assert!(revised.requires_approval);
    let revised_request = revised.approval.unwrap();
    assert_eq!(revised_request.id, request.id);
    assert_eq!(revised_request.state, ApprovalState::Edited);
    assert_eq!(revised_request.arguments()["action"], "restart staging");

    // 第二次编辑被拒绝，状态不变
    let again = json!({ "action": "drop everything" }).as_object().cloned().unwrap();
    let err = h
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Edit(again))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::Approval(ApprovalError::SingleRevision(_))
    ));
    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(state.status, ConversationStatus::AwaitingApproval);
    assert_eq!(
        state.pending_approval.as_ref().unwrap().arguments()["action"],
        "restart staging"
    );
    assert!(h.spy.invocations().is_empty());

    h.orchestrator
        .resume("t1", &request.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    let invocations = h.spy.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].0, "sensitive_call");
    assert_eq!(invocations[0].1["action"], "restart staging");
}

#[tokio::test]
async fn test_repeated_decision_is_already_resolved() {
    let h = harness(sensitive_then_answer()).await;
    let request = h.orchestrator.chat("t1", "do it").await.unwrap().approval.unwrap();
    h.orchestrator
        .resume("t1", &request.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    let before = h.orchestrator.snapshot("t1").await.unwrap();

    let err = h
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Reject)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::Approval(ApprovalError::AlreadyResolved(_))
    ));
    let after = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(before.messages, after.messages);
    assert_eq!(h.spy.invocations().len(), 1);
}

#[tokio::test]
async fn test_unknown_request_and_thread() {
    let h = harness(sensitive_then_answer()).await;
    h.orchestrator.chat("t1", "do it").await.unwrap();

    let err = h
        .orchestrator
        .resume("t1", "apr_missing", ApprovalDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::Approval(ApprovalError::UnknownRequest(_))
    ));

    let err = h
        .orchestrator
        .resume("nope", "apr_missing", ApprovalDecision::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ConversationNotFound(_)));
}

#[tokio::test]
async fn test_chat_while_awaiting_is_rejected() {
    let h = harness(sensitive_then_answer()).await;
    h.orchestrator.chat("t1", "do it").await.unwrap();
    let before = h.orchestrator.snapshot("t1").await.unwrap();

    let err = h.orchestrator.chat("t1", "hello?").await.unwrap_err();
    assert!(matches!(err, AgentError::AwaitingApproval(_)));

    let after = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(before.messages.len(), after.messages.len());
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_at_most_one_pending_request() {
    // 一个轮次里两个敏感调用：第一个挂起，第二个排队
    let h = harness(vec![
        Completion::calls(vec![
            ProposedCall::new(SENSITIVE, json!({ "action": "a" })),
            ProposedCall::new(SENSITIVE, json!({ "action": "b" })),
        ]),
        Completion::text("both handled"),
    ])
    .await;

    let first = h.orchestrator.chat("t1", "two things").await.unwrap();
    let first_request = first.approval.unwrap();
    assert_eq!(first_request.arguments()["action"], "a");
    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(state.queued_calls.len(), 1);

    let second = h
        .orchestrator
        .resume("t1", &first_request.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    assert!(second.requires_approval);
    let second_request = second.approval.unwrap();
    assert_ne!(second_request.id, first_request.id);
    assert_eq!(second_request.arguments()["action"], "b");
    // 第二个请求挂起时模型还没有被再次调用
    assert_eq!(h.llm.calls(), 1);

    let done = h
        .orchestrator
        .resume("t1", &second_request.id, ApprovalDecision::Reject)
        .await
        .unwrap();
    assert_eq!(done.response, "both handled");
    assert_eq!(h.spy.invocations().len(), 1);

    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert!(state.unanswered_calls().is_empty());
}

#[tokio::test]
async fn test_timeout_is_folded_and_conversation_continues() {
    let h = harness_with(
        vec![
            Completion::calls(vec![ProposedCall::new("server_x_lookup", json!({}))]),
            Completion::text("The lookup did not finish."),
        ],
        &[],
        Duration::from_millis(50),
        Arc::new(MemoryCheckpointer::new()),
    )
    .await;
    h.spy.set_delay(Duration::from_millis(200));

    let out = h.orchestrator.chat("t1", "look it up").await.unwrap();
    assert_eq!(out.response, "The lookup did not finish.");
    let folded = h.llm.seen()[1].last().unwrap().clone();
    assert_eq!(folded.role, Role::Tool);
    assert!(folded.content.contains("timed out"));
    let state = h.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(state.status, ConversationStatus::Completed);
}

#[tokio::test]
async fn test_approved_run_matches_unrestricted_run() {
    let approved = harness(sensitive_then_answer()).await;
    let request = approved
        .orchestrator
        .chat("t1", "do it")
        .await
        .unwrap()
        .approval
        .unwrap();
    approved
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Approve)
        .await
        .unwrap();

    let unrestricted = harness_with(
        sensitive_then_answer(),
        &[],
        Duration::from_secs(5),
        Arc::new(MemoryCheckpointer::new()),
    )
    .await;
    let out = unrestricted.orchestrator.chat("t1", "do it").await.unwrap();
    assert!(!out.requires_approval);

    let a = approved.orchestrator.snapshot("t1").await.unwrap();
    let b = unrestricted.orchestrator.snapshot("t1").await.unwrap();
    assert_eq!(a.messages, b.messages);
    assert_eq!(approved.spy.invocations(), unrestricted.spy.invocations());
}

#[tokio::test]
async fn test_resume_after_restart_from_file_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let first = harness_with(
        sensitive_then_answer(),
        &[SENSITIVE],
        Duration::from_secs(5),
        Arc::new(FileCheckpointer::new(dir.path())),
    )
    .await;
    let request = first
        .orchestrator
        .chat("t1", "do it")
        .await
        .unwrap()
        .approval
        .unwrap();
    drop(first);

    // 新进程：新的编排器，只共享检查点目录；模型脚本从第二步开始
    let restarted = harness_with(
        vec![Completion::text("Done after restart.")],
        &[SENSITIVE],
        Duration::from_secs(5),
        Arc::new(FileCheckpointer::new(dir.path())),
    )
    .await;
    let done = restarted
        .orchestrator
        .resume("t1", &request.id, ApprovalDecision::Approve)
        .await
        .unwrap();
    assert_eq!(done.response, "Done after restart.");
    assert_eq!(restarted.spy.invocations().len(), 1);
}

#[tokio::test]
async fn test_concurrent_request_on_same_thread_is_busy() {
    let h = harness(vec![
        Completion::calls(vec![ProposedCall::new("server_x_lookup", json!({}))]),
        Completion::text("slow answer"),
    ])
    .await;
    h.spy.set_delay(Duration::from_millis(300));

    let orchestrator = Arc::clone(&h.orchestrator);
    let running = tokio::spawn(async move { orchestrator.chat("t1", "first").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.orchestrator.chat("t1", "second").await.unwrap_err();
    assert!(matches!(err, AgentError::ThreadBusy(_)));

    // 其它线程不受影响
    let other = h.orchestrator.chat("t2", "independent").await;
    assert!(other.is_ok());

    // 两个线程共用同一份脚本，这里只关心第一个请求正常结束
    assert!(running.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_gated_capability_is_listed_as_sensitive() {
    let h = harness(sensitive_then_answer()).await;
    let registry = h.orchestrator.registry();
    let listed = registry.resolve(SENSITIVE).await.unwrap();
    assert!(listed.sensitive);
    assert!(!registry.resolve("server_x_lookup").await.unwrap().sensitive);

    let out = h.orchestrator.chat("t1", "do it").await.unwrap();
    assert!(out.requires_approval);
    assert_eq!(out.approval.unwrap().capability(), SENSITIVE);
}

#[tokio::test]
async fn test_similar_thread_ids_keep_separate_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(
        vec![
            Completion::calls(vec![ProposedCall::new(SENSITIVE, json!({ "action": "delete" }))]),
            Completion::text("hello"),
        ],
        &[SENSITIVE],
        Duration::from_secs(5),
        Arc::new(FileCheckpointer::new(dir.path())),
    )
    .await;

    let request = h
        .orchestrator
        .chat("team.a", "delete it")
        .await
        .unwrap()
        .approval
        .unwrap();
    let other = h.orchestrator.chat("team_a", "hi").await.unwrap();
    assert_eq!(other.response, "hello");

    let state = h.orchestrator.snapshot("team.a").await.unwrap();
    assert_eq!(state.status, ConversationStatus::AwaitingApproval);
    assert_eq!(state.pending_approval.unwrap().id, request.id);
}
