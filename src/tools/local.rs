//! 进程内工具服务器
//!
//! 进程内工具实现 Tool trait（name / description / parameters_schema / execute），由 LocalToolServer 按名注册，
//! 对 Registry 而言与远端服务器无差别。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::server::{RemoteTool, ServerError, ToolServer};
use crate::tools::EffectClass;

/// 进程内工具
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// 供模型理解功能
    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        crate::tools::server::empty_schema()
    }

    fn effect(&self) -> EffectClass {
        EffectClass::infer(self.name())
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 进程内工具服务器，默认名 "builtin"
pub struct LocalToolServer {
    name: String,
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl LocalToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for LocalToolServer {
    fn default() -> Self {
        Self::new("builtin")
    }
}

#[async_trait]
impl ToolServer for LocalToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ServerError> {
        Ok(self
            .tools
            .values()
            .map(|t| RemoteTool {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                effect: Some(t.effect()),
            })
            .collect())
    }

    async fn invoke(&self, tool: &str, arguments: &Value) -> Result<String, ServerError> {
        let t = self
            .tools
            .get(tool)
            .ok_or_else(|| ServerError::Protocol(format!("Unknown tool: {tool}")))?;
        t.execute(arguments.clone())
            .await
            .map_err(|message| ServerError::Execution {
                message,
                transient: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase text"
        }
        async fn execute(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(Value::as_str)
                .map(str::to_uppercase)
                .ok_or_else(|| "missing text".to_string())
        }
    }

    #[tokio::test]
    async fn test_local_server_lists_and_invokes() {
        let server = LocalToolServer::default().with_tool(Upper);
        let tools = server.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].effect, Some(EffectClass::Action));

        let out = server.invoke("upper", &json!({"text": "ciao"})).await.unwrap();
        assert_eq!(out, "CIAO");

        let err = server.invoke("upper", &json!({})).await.unwrap_err();
        assert!(matches!(err, ServerError::Execution { transient: false, .. }));
    }

    #[tokio::test]
    async fn test_unknown_local_tool_is_protocol_error() {
        let server = LocalToolServer::default();
        let err = server.invoke("nope", &json!({})).await.unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
    }
}
