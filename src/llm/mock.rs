//! Mock / Scripted 后端（用于测试与无 API Key 时的本地运行）
//!
//! MockBackend 回显最后一条 User 消息；ScriptedBackend 按队列依次返回预设回复，并记录收到的请求，
//! 便于集成测试驱动完整的一轮编排。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmError, ModelBackend, ModelEvent, ModelRequest, ModelStream, ProposedCall};
use crate::memory::Role;

/// Mock 后端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, LlmError> {
        let last_user = request
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or("(no input)");
        let text = format!("Echo from Mock: {last_user}");
        Ok(Box::pin(stream::iter(vec![Ok(ModelEvent::TextDelta(text))])))
    }
}

/// 预设回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// 以多个片段流式返回的文本
    Text(Vec<String>),
    Calls(Vec<ProposedCall>),
    Fail(LlmError),
    /// 永不返回（用于超时、取消测试）
    Stall,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(vec![text.into()])
    }

    pub fn call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ScriptedReply::Calls(vec![ProposedCall {
            id: None,
            name: name.into(),
            arguments,
        }])
    }
}

/// 脚本化后端：按顺序消费回复；队列耗尽后返回 fallback 文本
pub struct ScriptedBackend {
    name: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ModelRequest>>,
    native_tools: bool,
    delay: Option<Duration>,
    fallback: String,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            name: "scripted".to_string(),
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            native_tools: true,
            delay: None,
            fallback: "OK.".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_native_tools(mut self, enabled: bool) -> Self {
        self.native_tools = enabled;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }

    /// 已收到的请求（按时间顺序）
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, LlmError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        match next.unwrap_or_else(|| ScriptedReply::text(self.fallback.clone())) {
            ScriptedReply::Text(chunks) => Ok(Box::pin(stream::iter(
                chunks.into_iter().map(|c| Ok(ModelEvent::TextDelta(c))),
            ))),
            ScriptedReply::Calls(calls) => {
                Ok(Box::pin(stream::iter(vec![Ok(ModelEvent::ToolCalls(calls))])))
            }
            ScriptedReply::Fail(e) => Err(e),
            ScriptedReply::Stall => {
                std::future::pending::<()>().await;
                Err(LlmError::Cancelled)
            }
        }
    }
}
