//! 核心编排层：错误、对话状态、线程守卫、主控循环、优雅关闭

pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod thread_guard;

pub use error::{AgentError, ApprovalError, CapabilityError, CheckpointError};
pub use orchestrator::{create_llm_from_config, AgentOrchestrator, TurnOutcome};
pub use shutdown::{
    CapabilityServersCleanup, CheckpointCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::{AgentPhase, ConversationState, ConversationStatus};
pub use thread_guard::{ThreadGuard, ThreadPermit};
