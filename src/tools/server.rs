//! 工具服务器协议
//!
//! 发现：list_tools → 描述列表（名称、schema、描述、可选副作用类别）；
//! 调用：invoke(name, arguments) → 载荷或结构化错误（带 transient 标记）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::EffectClass;

/// 服务器端返回的原始工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema", alias = "inputSchema", alias = "input_schema")]
    pub parameters: Value,
    /// 未声明时由名称推断
    #[serde(default)]
    pub effect: Option<EffectClass>,
}

pub(crate) fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}, "required": []})
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("{message}")]
    Execution { message: String, transient: bool },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// 工具服务器
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ServerError>;

    async fn invoke(&self, tool: &str, arguments: &Value) -> Result<String, ServerError>;
}
