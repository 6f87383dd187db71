//! 核心：会话编排、构建、恢复策略、轮次监管与工具并发

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use builder::SessionBuilder;
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{
    build_session, spawn_session, Command, Session, SessionHandle, SessionOutput, SessionStats, TurnInput,
    TurnOutcome,
};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::TaskScheduler;
