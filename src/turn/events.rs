//! 单轮过程事件：旁路推送给上游（确认语、工具状态、流式叙述等）

use serde::Serialize;
use tokio::sync::mpsc;

use crate::intent::Classification;
use crate::tools::DegradedServer;

/// 事件种类（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEventKind {
    /// 意图分类结果
    Classified { classification: Classification },
    /// 工具路径上派发前的简短确认语
    Acknowledgment { text: String },
    /// 调用工具
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
        hop: usize,
    },
    /// 工具执行中的状态文本
    ToolStatus { text: String },
    /// 工具返回（预览）
    ToolResult {
        call_id: String,
        tool: String,
        success: bool,
        preview: String,
    },
    /// 调用被校验拒绝
    Rejected { tool: String, reason: String },
    /// 重试
    Retry { attempt: u32, reason: String },
    /// 续接没有产出调用（软完成）
    FollowupWarning { detail: String },
    /// 叙述的一小段（流式输出）
    NarrationChunk { text: String },
    NarrationDone,
    /// 部分工具服务器不可用
    DegradedTools { servers: Vec<DegradedServer> },
    Error { text: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnEvent {
    pub turn_id: String,
    #[serde(flatten)]
    pub kind: TurnEventKind,
}

/// 事件发送端；没有订阅者时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, turn_id: &str, kind: TurnEventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TurnEvent {
                turn_id: turn_id.to_string(),
                kind,
            });
        }
    }
}
