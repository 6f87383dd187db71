//! 工具调用 JSON Schema 生成（schemars）
//!
//! prompt 模式下把「合法 tool call」的结构与可用工具列表拼进 Broker 的指令，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::tools::ToolDescriptor;

/// prompt 模式下的调用格式：`{"tool": "...", "args": {...}}`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ToolCallFormat {
    /// 工具名，必须出现在 Available tools 中
    pub tool: String,
    /// 工具参数，按该工具的 parameters schema 填写
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Available tools 段落：名称、类别、描述、参数 schema
pub fn tools_prompt_section(tools: &[ToolDescriptor]) -> String {
    let listed: Vec<serde_json::Value> = tools
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name,
                "kind": d.effect,
                "description": d.description,
                "parameters": d.parameters,
            })
        })
        .collect();
    serde_json::to_string_pretty(&listed).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("\"tool\""));
        assert!(schema.contains("\"args\""));
    }
}
