//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Retry / Narrate / SoftComplete / Ignore / Abort。
//! 校验、执行、续接阶段的错误都落到 ToolResult 上，不会越过会话边界；只有后端完全不可用才上抛。

use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::Rejection;

/// 单轮编排中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 意图分类超时（路由为 DIRECT）
    #[error("Intent classification timed out")]
    ClassificationTimeout,

    /// 校验未通过（未知工具、缺参、类型不符、跨类别不匹配）
    #[error("Rejected: {0}")]
    Rejected(Rejection),

    #[error("Tool server '{server}' unreachable: {reason}")]
    ToolServerUnreachable { server: String, reason: String },

    #[error("Tool '{tool}' timed out after {after_ms}ms")]
    ToolTimeout { tool: String, after_ms: u64 },

    #[error("Tool execution failed: {message}")]
    ToolExecutionError { message: String, transient: bool },

    /// 批内依赖的调用失败，未派发
    #[error("Tool '{tool}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { tool: String, dependency: String },

    #[error("Follow-up produced no tool calls")]
    FollowupExhausted,

    #[error("Conversation memory over capacity")]
    MemoryOverflow,

    #[error("LLM error: {0}")]
    Llm(LlmError),

    /// 没有任何可用模型，唯一会上抛到会话层的错误
    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Turn cancelled")]
    Cancelled,
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Cancelled => AgentError::Cancelled,
            other => AgentError::Llm(other),
        }
    }
}

impl From<Rejection> for AgentError {
    fn from(r: Rejection) -> Self {
        AgentError::Rejected(r)
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 在预算内重新派发（附带错误反馈）
    Retry,
    /// 不重试，把原因交给叙述阶段（如缺参时请用户补充）
    Narrate(String),
    /// 软完成：以已有结果叙述，不伪造成功
    SoftComplete,
    /// 静默处理（如淘汰旧记录）
    Ignore,
    /// 终止当前轮
    Abort,
}
