//! OpenAI 兼容后端
//!
//! 对话叙述通过 async_openai 的流式接口（可配置 base_url）；需要原生 tool calling 时，
//! 由于工具 schema 是动态 JSON，直接用 reqwest POST `{base}/chat/completions` 并解析 `message.tool_calls`。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use crate::llm::{LlmError, ModelBackend, ModelEvent, ModelRequest, ModelStream, ProposedCall};
use crate::memory::Role;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    native_tools: bool,
}

impl OpenAiBackend {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: &str,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let config = OpenAIConfig::new()
            .with_api_base(base_url.clone())
            .with_api_key(api_key.to_string());
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(Self {
            client: Client::with_config(config),
            http,
            base_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
            native_tools: true,
        })
    }

    /// 关闭原生 tool calling（部分本地模型不支持），Broker 改走 prompt 模式
    pub fn with_native_tools(mut self, enabled: bool) -> Self {
        self.native_tools = enabled;
        self
    }

    fn to_openai_messages(
        &self,
        request: &ModelRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let build_err = |e: async_openai::error::OpenAIError| LlmError::Api(e.to_string());
        let mut out = Vec::with_capacity(request.turns.len() + 1);
        if !request.system.is_empty() {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system.clone())
                    .build()
                    .map_err(build_err)?,
            ));
        }
        for turn in &request.turns {
            let message = match turn.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(turn.content.clone())
                        .build()
                        .map_err(build_err)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.content.clone())
                        .build()
                        .map_err(build_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()
                        .map_err(build_err)?,
                ),
            };
            out.push(message);
        }
        Ok(out)
    }

    async fn narrate(&self, request: &ModelRequest) -> Result<ModelStream, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .stream(true)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let upstream = self
            .client
            .chat()
            .create_stream(body)
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let mapped = upstream.filter_map(|chunk| async move {
            match chunk {
                Ok(resp) => {
                    let text: String = resp
                        .choices
                        .iter()
                        .filter_map(|c| c.delta.content.clone())
                        .collect();
                    (!text.is_empty()).then_some(Ok(ModelEvent::TextDelta(text)))
                }
                Err(e) => Some(Err(LlmError::Api(e.to_string()))),
            }
        });
        Ok(Box::pin(mapped))
    }

    async fn call_with_tools(&self, request: &ModelRequest) -> Result<ModelStream, LlmError> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({"role": "system", "content": request.system}));
        }
        for turn in &request.turns {
            let role = match turn.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        let tools: Vec<Value> = request
            .tools
            .iter()
            .flatten()
            .map(|d| {
                json!({
                    "type": "function",
                    "function": {
                        "name": d.name,
                        "description": d.description,
                        "parameters": d.parameters,
                    }
                })
            })
            .collect();
        let mut payload = json!({"model": self.model, "messages": messages});
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools);
            payload["tool_choice"] = json!("auto");
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(0)
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                LlmError::Unavailable(text)
            } else if status.is_server_error() || status.as_u16() == 429 {
                LlmError::Network(format!("HTTP {status}: {text}"))
            } else {
                LlmError::Api(format!("HTTP {status}: {text}"))
            });
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(Box::pin(stream::iter(
            parse_completion(&data)?.into_iter().map(Ok),
        )))
    }
}

/// 解析非流式 chat completion：content → TextDelta，tool_calls → ToolCalls
pub fn parse_completion(data: &Value) -> Result<Vec<ModelEvent>, LlmError> {
    let message = data
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::Parse("No message in response".to_string()))?;

    let mut events = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
    }
    let calls: Vec<ProposedCall> = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = match function.get("arguments") {
                        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
                        Some(Value::String(raw)) => serde_json::from_str(raw)
                            .unwrap_or_else(|_| Value::String(raw.clone())),
                        Some(other) => other.clone(),
                        None => json!({}),
                    };
                    Some(ProposedCall {
                        id: tc.get("id").and_then(Value::as_str).map(String::from),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if !calls.is_empty() {
        events.push(ModelEvent::ToolCalls(calls));
    }
    Ok(events)
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, LlmError> {
        if request.tools.is_some() && self.native_tools {
            self.call_with_tools(&request).await
        } else {
            self.narrate(&request).await
        }
    }
}
