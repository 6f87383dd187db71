//! 模型后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 ModelBackend：输入 (system, turns, 可选工具枚举)，
//! 输出可取消的事件流（文本增量或工具调用）。collect_reply 负责在超时与取消下把流收拢为一次回复。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::Turn;
use crate::tools::ToolDescriptor;

/// 模型后端错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("model request timed out after {0}ms")]
    Timeout(u64),

    #[error("model generation cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("malformed model output: {0}")]
    Parse(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// 超时与网络错误可重试
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Timeout(_) | LlmError::Network(_))
    }
}

/// 一次模型请求
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    /// None 表示纯对话；Some 表示允许（原生）工具调用
    pub tools: Option<Vec<ToolDescriptor>>,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            system: system.into(),
            turns,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescriptor>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// 模型提出的工具调用（尚未校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// 流式事件
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCalls(Vec<ProposedCall>),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, LlmError>> + Send>>;

/// 收拢后的完整回复
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub calls: Vec<ProposedCall>,
}

/// 模型后端 trait
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 是否支持原生 tool calling；否则 Broker 走 prompt 模式（文本中的 JSON）
    fn supports_native_tools(&self) -> bool {
        false
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, LlmError>;
}

/// 在超时与取消约束下消费整个流；on_delta 收到每段文本（用于流式播报）
pub async fn collect_reply<F>(
    backend: &dyn ModelBackend,
    request: ModelRequest,
    cancel: &CancellationToken,
    limit: Duration,
    mut on_delta: F,
) -> Result<ModelReply, LlmError>
where
    F: FnMut(&str) + Send,
{
    let work = async {
        let mut stream = backend.stream(request).await?;
        let mut reply = ModelReply::default();
        while let Some(event) = stream.next().await {
            match event? {
                ModelEvent::TextDelta(delta) => {
                    on_delta(&delta);
                    reply.text.push_str(&delta);
                }
                ModelEvent::ToolCalls(calls) => reply.calls.extend(calls),
            }
        }
        Ok(reply)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        res = tokio::time::timeout(limit, work) => match res {
            Ok(reply) => reply,
            Err(_) => Err(LlmError::Timeout(limit.as_millis() as u64)),
        },
    }
}
