//! 工具描述、调用与结果
//!
//! ToolDescriptor 由 Registry 从各工具服务器发现得到；ToolCall 是 Broker 提出、Validator 检查过的调用；
//! ToolResult 与 ToolCall 一一对应，失败时 content 为 "Error: ..." 形式的归一化文本。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 副作用类别：只读的发现类 / 会修改外部状态的动作类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectClass {
    Discovery,
    Action,
}

impl EffectClass {
    /// 服务器未声明时按名称推断：Get/List/Search/Read 前缀视为发现类
    pub fn infer(name: &str) -> Self {
        let lower = name.to_lowercase();
        const DISCOVERY_PREFIXES: [&str; 6] = ["get", "list", "search", "read", "find", "query"];
        if DISCOVERY_PREFIXES.iter().any(|p| lower.starts_with(p))
            || lower.ends_with("context")
            || lower.ends_with("state")
        {
            EffectClass::Discovery
        } else {
            EffectClass::Action
        }
    }
}

/// 工具类别：用于意图范围收窄与跨类别校验
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    Time,
    Search,
    DeviceControl,
    Other,
}

impl ToolFamily {
    pub fn infer(name: &str, description: &str) -> Self {
        let name = name.to_lowercase();
        let description = description.to_lowercase();
        let hay = format!("{name} {description}");
        if name.starts_with("hass") {
            ToolFamily::DeviceControl
        } else if ["time", "clock", "timezone", "date"]
            .iter()
            .any(|k| name.contains(k))
        {
            ToolFamily::Time
        } else if ["search", "web", "news", "weather", "lookup"]
            .iter()
            .any(|k| name.contains(k))
        {
            ToolFamily::Search
        } else if ["device", "light", "switch", "speaker", "turn on", "turn off", "entity"]
            .iter()
            .any(|k| hay.contains(k))
        {
            ToolFamily::DeviceControl
        } else {
            ToolFamily::Other
        }
    }
}

/// 工具描述：暴露名（必要时带来源前缀）、远端原名、参数 schema、副作用类别、来源服务器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// 会话内唯一的暴露名
    pub name: String,
    /// 在来源服务器上的原名（派发时使用）
    pub remote_name: String,
    pub origin: String,
    pub description: String,
    /// JSON Schema（object）
    pub parameters: Value,
    pub effect: EffectClass,
    pub family: ToolFamily,
}

impl ToolDescriptor {
    /// schema 中声明的必填参数
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// 某参数声明的 JSON 类型（"string" / "integer" / ...）
    pub fn param_type(&self, param: &str) -> Option<&str> {
        self.parameters
            .get("properties")
            .and_then(|p| p.get(param))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }

    pub fn is_discovery(&self) -> bool {
        self.effect == EffectClass::Discovery
    }
}

/// 一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    /// 发起该调用的轮次
    pub turn_id: String,
    /// 同批次内需先完成的调用 id
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ToolCall {
    pub fn new(turn_id: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            tool: tool.into(),
            arguments,
            turn_id: turn_id.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depending_on(mut self, call_id: impl Into<String>) -> Self {
        self.depends_on.push(call_id.into());
        self
    }
}

/// 工具结果：与 ToolCall 一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    /// 成功时为载荷，失败时为 "Error: ..."
    pub content: String,
    pub failure: Option<AgentError>,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: true,
            content: content.into(),
            failure: None,
            attempt: 1,
        }
    }

    pub fn failed(call: &ToolCall, err: AgentError) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            success: false,
            content: format!("Error: {err}"),
            failure: Some(err),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}
