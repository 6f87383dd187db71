//! 会话构建器：统一的会话初始化逻辑
//!
//! 按配置创建三个模型后端、工具服务器、意图路由与各阶段组件；测试或嵌入方可以注入自己的后端和工具服务器。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, BackendSection, IntentMethod, ServerKind};
use crate::core::orchestrator::Session;
use crate::core::RecoveryEngine;
use crate::intent::{DisambiguationRule, IntentClassifier, IntentRouter, KeywordClassifier, ModelIntentClassifier};
use crate::llm::{MockBackend, ModelBackend, OpenAiBackend};
use crate::memory::{ConversationMemory, TranscriptStore};
use crate::tools::{CurrentTimeTool, HttpToolServer, LocalToolServer, ToolExecutor, ToolRegistry, ToolServer};
use crate::turn::{Acknowledger, ConversationResponder, EventSink, ToolBroker, TurnPolicy};

/// 会话构建器
pub struct SessionBuilder {
    config: AppConfig,
    conversation: Option<Arc<dyn ModelBackend>>,
    tool: Option<Arc<dyn ModelBackend>>,
    intent: Option<Arc<dyn ModelBackend>>,
    servers: Option<Vec<Arc<dyn ToolServer>>>,
    events: EventSink,
}

impl SessionBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            conversation: None,
            tool: None,
            intent: None,
            servers: None,
            events: EventSink::disabled(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 叙述模型（人设）
    pub fn with_conversation_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.conversation = Some(backend);
        self
    }

    /// 工具调用模型（技术指令）
    pub fn with_tool_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.tool = Some(backend);
        self
    }

    /// 意图分类模型（仅 method = model 时使用）
    pub fn with_intent_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.intent = Some(backend);
        self
    }

    /// 替换配置中的工具服务器
    pub fn with_servers(mut self, servers: Vec<Arc<dyn ToolServer>>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.llm.request_timeout_secs.max(1))
    }

    /// 根据配置与环境变量选择后端：有 API Key 走 OpenAI 兼容端点，否则 Mock
    pub fn build_backend(section: &BackendSection, timeout: Duration) -> anyhow::Result<Arc<dyn ModelBackend>> {
        let provider = section.provider.to_lowercase();
        if provider == "mock" {
            return Ok(Arc::new(MockBackend));
        }
        match section.api_key() {
            Some(key) => {
                tracing::info!(model = %section.model, base_url = ?section.base_url, "Using OpenAI-compatible backend");
                let backend = OpenAiBackend::new(section.base_url.as_deref(), &section.model, &key, timeout)
                    .context("Failed to create OpenAI backend")?
                    .with_native_tools(section.native_tools);
                Ok(Arc::new(backend))
            }
            None => {
                tracing::warn!(
                    env = %section.api_key_env,
                    "No API key found, using Mock LLM"
                );
                Ok(Arc::new(MockBackend))
            }
        }
    }

    /// 按配置创建工具服务器；内置服务器提供时钟工具
    pub fn build_servers(&self) -> anyhow::Result<Vec<Arc<dyn ToolServer>>> {
        let timeout = Duration::from_secs(self.config.tools.tool_timeout_secs.max(1));
        let mut servers: Vec<Arc<dyn ToolServer>> = Vec::new();
        for entry in self.config.tools.servers.iter().filter(|s| s.enabled) {
            match entry.kind {
                ServerKind::Builtin => {
                    servers.push(Arc::new(LocalToolServer::new(&entry.name).with_tool(CurrentTimeTool)));
                }
                ServerKind::Http => {
                    let url = entry
                        .url
                        .as_deref()
                        .with_context(|| format!("tool server '{}' has no url", entry.name))?;
                    let server = HttpToolServer::new(&entry.name, url, timeout)
                        .with_context(|| format!("Failed to create tool server '{}'", entry.name))?;
                    servers.push(Arc::new(server));
                }
            }
        }
        Ok(servers)
    }

    /// 意图路由：关键词规则表或小模型；配置中的覆盖规则排在内置表之前
    pub fn build_router(&self, timeout: Duration) -> anyhow::Result<IntentRouter> {
        let section = &self.config.intent;
        let overrides: Vec<DisambiguationRule> = section
            .overrides
            .iter()
            .map(|o| DisambiguationRule::new(&o.name, &o.keywords, o.intent, o.family))
            .collect();
        let keyword = KeywordClassifier::with_overrides(overrides);
        let limit = Duration::from_millis(section.timeout_ms.max(1));

        let router = match section.method {
            IntentMethod::Keyword => IntentRouter::new(Arc::new(keyword), limit),
            IntentMethod::Model => {
                let backend = match &self.intent {
                    Some(b) => b.clone(),
                    None => Self::build_backend(&self.config.llm.intent, timeout)?,
                };
                let classifier: Arc<dyn IntentClassifier> = Arc::new(ModelIntentClassifier::new(backend, limit));
                IntentRouter::new(classifier, limit).with_scoper(keyword)
            }
        };
        tracing::info!(method = router.method(), "intent router ready");
        Ok(router)
    }

    pub fn build_policy(&self) -> TurnPolicy {
        TurnPolicy {
            max_followups: self.config.turn.max_followups,
            max_retries: self.config.turn.max_retries,
            retry_backoff: Duration::from_millis(self.config.turn.retry_backoff_ms),
        }
    }

    /// 完成构建：发现工具（单个服务器失败不阻塞）并恢复对话记录
    pub async fn build(self) -> anyhow::Result<Session> {
        let timeout = self.request_timeout();
        let conversation = match &self.conversation {
            Some(b) => b.clone(),
            None => Self::build_backend(&self.config.llm.conversation, timeout)?,
        };
        let tool = match &self.tool {
            Some(b) => b.clone(),
            None => Self::build_backend(&self.config.llm.tool, timeout)?,
        };
        let servers = match &self.servers {
            Some(s) => s.clone(),
            None => self.build_servers()?,
        };
        let router = self.build_router(timeout)?;
        let policy = self.build_policy();

        let cfg = &self.config;
        let (registry, discovery) = ToolRegistry::discover(
            servers,
            Duration::from_secs(cfg.tools.discovery_timeout_secs.max(1)),
            cfg.tools.excluded_tools.clone(),
        )
        .await;
        if discovery.is_degraded() {
            tracing::warn!(degraded = ?discovery.degraded, "some tool servers are unavailable");
        }

        let mut memory = ConversationMemory::with_system(cfg.app.memory_cap, &cfg.app.persona);
        let transcript = cfg.app.transcript_path.as_ref().map(TranscriptStore::new);
        if let Some(store) = &transcript {
            match store.restore_into(&mut memory) {
                Ok(evicted) if evicted > 0 => tracing::info!(evicted, "transcript trimmed to memory cap"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to restore transcript, starting fresh"),
            }
        }

        let acknowledger = cfg
            .turn
            .acknowledgments_enabled
            .then(|| Acknowledger::new(cfg.turn.acknowledgments.clone()));

        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            memory,
            registry,
            discovery,
            router,
            broker: ToolBroker::new(tool, timeout).with_window(cfg.turn.history_window),
            responder: ConversationResponder::new(conversation, &cfg.app.persona, timeout),
            executor: ToolExecutor::new(
                Duration::from_secs(cfg.tools.tool_timeout_secs.max(1)),
                cfg.tools.max_in_flight,
            ),
            recovery: RecoveryEngine::new(),
            policy,
            acknowledger,
            events: self.events,
            supervisor: Default::default(),
            stats: Default::default(),
            turn_counter: 0,
            transcript,
        })
    }
}
