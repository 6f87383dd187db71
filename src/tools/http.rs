//! HTTP JSON 工具服务器客户端
//!
//! `GET {base}/tools` 返回 `[{name, description, parameters, effect?}]` 或 `{"tools": [...]}`；
//! `POST {base}/tools/call` 请求体 `{name, arguments}`，响应 `{ok, content, transient?}`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::server::{RemoteTool, ServerError, ToolServer};

pub struct HttpToolServer {
    name: String,
    base_url: String,
    client: Client,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolListing {
    Bare(Vec<RemoteTool>),
    Wrapped { tools: Vec<RemoteTool> },
}

#[derive(Deserialize)]
struct CallResponse {
    ok: bool,
    #[serde(default)]
    content: String,
    #[serde(default)]
    transient: bool,
}

impl HttpToolServer {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn map_send_error(e: reqwest::Error) -> ServerError {
        if e.is_connect() || e.is_timeout() {
            ServerError::Unreachable(e.to_string())
        } else {
            ServerError::Protocol(e.to_string())
        }
    }
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>, ServerError> {
        let resp = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(ServerError::Unreachable(format!("HTTP {}", resp.status())));
        }
        let listing: ToolListing = resp
            .json()
            .await
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        Ok(match listing {
            ToolListing::Bare(tools) | ToolListing::Wrapped { tools } => tools,
        })
    }

    async fn invoke(&self, tool: &str, arguments: &Value) -> Result<String, ServerError> {
        let resp = self
            .client
            .post(format!("{}/tools/call", self.base_url))
            .json(&json!({"name": tool, "arguments": arguments}))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ServerError::Execution {
                message: format!("HTTP {status}"),
                transient: true,
            });
        }
        let body: CallResponse = resp
            .json()
            .await
            .map_err(|e| ServerError::Protocol(e.to_string()))?;
        if body.ok {
            Ok(body.content)
        } else {
            Err(ServerError::Execution {
                message: body.content,
                transient: body.transient,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_accepts_both_shapes() {
        let bare: ToolListing =
            serde_json::from_str(r#"[{"name": "GetLiveContext"}]"#).unwrap();
        let wrapped: ToolListing = serde_json::from_str(
            r#"{"tools": [{"name": "HassTurnOff", "inputSchema": {"type": "object"}, "effect": "action"}]}"#,
        )
        .unwrap();
        match bare {
            ToolListing::Bare(t) => assert_eq!(t[0].name, "GetLiveContext"),
            _ => panic!("expected bare listing"),
        }
        match wrapped {
            ToolListing::Wrapped { tools } => {
                assert_eq!(tools[0].parameters["type"], "object");
                assert_eq!(tools[0].effect, Some(crate::tools::EffectClass::Action));
            }
            _ => panic!("expected wrapped listing"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_reported() {
        let server =
            HttpToolServer::new("home", "http://127.0.0.1:9", Duration::from_millis(300)).unwrap();
        let err = server.list_tools().await.unwrap_err();
        assert!(matches!(err, ServerError::Unreachable(_)));
    }
}
