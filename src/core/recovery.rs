//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供续接控制器决定是重试、交给叙述、软完成还是终止。

use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Rejected(rejection) => RecoveryAction::Narrate(rejection.hint()),
            AgentError::ToolServerUnreachable { .. }
            | AgentError::ToolTimeout { .. }
            // 依赖失败：只有依赖本身可重试时才随之重派（由续接控制器判断）
            | AgentError::DependencyFailed { .. } => RecoveryAction::Retry,
            AgentError::ToolExecutionError { transient: true, .. } => RecoveryAction::Retry,
            AgentError::ToolExecutionError { message, .. } => {
                RecoveryAction::Narrate(format!("The tool reported an error: {message}"))
            }
            AgentError::FollowupExhausted => RecoveryAction::SoftComplete,
            AgentError::MemoryOverflow | AgentError::ClassificationTimeout => RecoveryAction::Ignore,
            AgentError::Llm(e) if e.is_transient() => RecoveryAction::Retry,
            AgentError::Llm(LlmError::Parse(raw)) => RecoveryAction::Narrate(format!(
                "The tool model produced an unreadable reply: {raw}"
            )),
            AgentError::Llm(_) => RecoveryAction::SoftComplete,
            AgentError::BackendUnavailable(_) | AgentError::Config(_) | AgentError::Cancelled => {
                RecoveryAction::Abort
            }
        }
    }

    /// 是否应重试（续接控制器用）
    pub fn is_retryable(&self, err: &AgentError) -> bool {
        matches!(self.handle(err), RecoveryAction::Retry)
    }
}
