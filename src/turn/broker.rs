//! Tool Broker：工具调用生成
//!
//! 只给模型技术性指令（不含人设）、最近若干轮对话与工具枚举，产出零个或多个 ToolCall。
//! 后端支持原生 tool calling 时直接取结构化调用；否则走 prompt 模式，从文本中解析
//! `{"tool": ..., "args": ...}` 或 `{"name": ..., "arguments": ...}`。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{collect_reply, LlmError, ModelBackend, ModelRequest, ProposedCall};
use crate::memory::Turn;
use crate::tools::{tool_call_schema_json, tools_prompt_section, EffectClass, ToolCall, ToolDescriptor};

/// 默认对话窗口（条）
pub const DEFAULT_HISTORY_WINDOW: usize = 6;

const TOOL_INSTRUCTIONS: &str = "\
You are a technical tool execution agent. Your only job is to call the right tools with correct parameters for the user's request.

Rules:
1. Do not chat and do not write prose.
2. Never guess device names, entity ids, locations or other identifiers.
3. When an action needs an identifier you do not know, call the discovery tool first.
4. Copy identifiers exactly as the discovery result shows them.
5. Weather questions go to search tools, not time tools.
6. Clock questions (\"che ore sono\", \"what time is it\") go to the time tool.
7. Only use tools from the list you were given.";

pub struct ToolBroker {
    backend: Arc<dyn ModelBackend>,
    window: usize,
    timeout: Duration,
}

impl ToolBroker {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            window: DEFAULT_HISTORY_WINDOW,
            timeout,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// 技术指令：规则 + 发现类工具提示；prompt 模式再附调用格式与工具列表
    pub fn instructions(&self, tools: &[ToolDescriptor]) -> String {
        let mut out = String::from(TOOL_INSTRUCTIONS);
        let discovery: Vec<&str> = tools
            .iter()
            .filter(|d| d.effect == EffectClass::Discovery)
            .map(|d| d.name.as_str())
            .collect();
        if !discovery.is_empty() {
            out.push_str(&format!(
                "\n\nDiscovery tools (read-only, call these first when identifiers are unknown): {}",
                discovery.join(", ")
            ));
        }
        if !self.backend.supports_native_tools() {
            out.push_str(&format!(
                "\n\nTo call a tool, reply with ONLY one JSON object (or a JSON array of them) matching this schema:\n{}\n\
                 Example: {{\"tool\": \"get_current_time\", \"args\": {{}}}}\n\
                 If no tool is needed, reply with an empty JSON array [].\n\nAvailable tools:\n{}",
                tool_call_schema_json(),
                tools_prompt_section(tools)
            ));
        }
        out
    }

    /// 产出本跳的调用。window 为最近对话（包含本轮用户输入），scratch 为本轮已有的工具往返与指令。
    pub async fn propose(
        &self,
        turn_id: &str,
        window: &[Turn],
        scratch: &[Turn],
        tools: &[ToolDescriptor],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolCall>, AgentError> {
        let mut turns: Vec<Turn> = window
            .iter()
            .skip(window.len().saturating_sub(self.window))
            .cloned()
            .collect();
        turns.extend(scratch.iter().cloned());

        let mut request = ModelRequest::new(self.instructions(tools), turns);
        if self.backend.supports_native_tools() {
            request = request.with_tools(tools.to_vec());
        }

        let reply = collect_reply(self.backend.as_ref(), request, cancel, self.timeout, |_| {}).await?;
        let proposed = if !reply.calls.is_empty() {
            reply.calls
        } else if self.backend.supports_native_tools() {
            // 原生模式下部分模型仍会把调用写进文本
            parse_text_calls(&reply.text).unwrap_or_default()
        } else {
            parse_text_calls(&reply.text)?
        };

        let calls = bind_calls(turn_id, proposed, tools);
        tracing::info!(
            backend = self.backend.name(),
            calls = ?calls.iter().map(|c| c.tool.as_str()).collect::<Vec<_>>(),
            "broker proposed"
        );
        Ok(calls)
    }
}

/// 续接指令：重述原始请求，要求逐字复制发现结果中的标识
pub fn followup_directive(original_request: &str) -> String {
    format!(
        "The discovery result above lists the available identifiers.\n\
         Now complete the original request: \"{original_request}\".\n\
         Call the action tool with the exact names copied from that result. \
         Do not call the discovery tool again and do not reply with text."
    )
}

/// 从文本中提取调用：```json 代码块或首个 `{`/`[` 到末尾 `}`/`]`
pub fn parse_text_calls(text: &str) -> Result<Vec<ProposedCall>, LlmError> {
    let trimmed = text.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let open = trimmed.find(['{', '[']);
        let close = trimmed.rfind(['}', ']']);
        match (open, close) {
            (Some(s), Some(e)) if e > s => &trimmed[s..=e],
            _ => return Ok(Vec::new()),
        }
    };

    let value: Value =
        serde_json::from_str(json_str).map_err(|e| LlmError::Parse(format!("{e}: {json_str}")))?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items.iter().filter_map(proposed_from_value).collect())
}

fn proposed_from_value(v: &Value) -> Option<ProposedCall> {
    let name = v
        .get("tool")
        .or_else(|| v.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())?
        .to_string();
    let arguments = v
        .get("args")
        .or_else(|| v.get("arguments"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(ProposedCall {
        id: v.get("id").and_then(Value::as_str).map(String::from),
        name,
        arguments,
    })
}

/// 归一化参数并绑定批内依赖：动作调用依赖同一来源、排在它之前的发现调用
fn bind_calls(turn_id: &str, proposed: Vec<ProposedCall>, tools: &[ToolDescriptor]) -> Vec<ToolCall> {
    let lookup = |name: &str| tools.iter().find(|d| d.name == name || d.remote_name == name);
    let mut calls: Vec<ToolCall> = Vec::with_capacity(proposed.len());
    for p in proposed {
        let arguments = match p.arguments {
            Value::Null => Value::Object(Default::default()),
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(v @ Value::Object(_)) => v,
                _ => Value::String(raw),
            },
            other => other,
        };
        let mut call = ToolCall::new(turn_id, p.name, arguments);
        if let Some(id) = p.id {
            call = call.with_id(id);
        }
        if let Some(d) = lookup(&call.tool).filter(|d| d.effect == EffectClass::Action) {
            let dependency = calls.iter().rev().find(|prev| {
                lookup(&prev.tool).is_some_and(|pd| pd.effect == EffectClass::Discovery && pd.origin == d.origin)
            });
            if let Some(dep) = dependency {
                call = call.depending_on(dep.id.clone());
            }
        }
        calls.push(call);
    }
    calls
}
