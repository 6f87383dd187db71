//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DUET__*` 覆盖（双下划线表示嵌套，如 `DUET__TURN__MAX_RETRIES=2`）。
//! 所有字段都有默认值，找不到文件时得到一份可运行的默认配置。

use std::path::PathBuf;

use serde::Deserialize;

use crate::intent::Intent;
use crate::tools::ToolFamily;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub turn: TurnSection,
    pub intent: IntentSection,
}

/// [app] 段：名称、人设、记忆上限、对话记录文件
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 叙述模型的人设 prompt（记忆中的首条 system）
    #[serde(default = "default_persona")]
    pub persona: String,
    /// 对话记忆条数上限
    #[serde(default = "default_memory_cap")]
    pub memory_cap: usize,
    /// 设置后，会话开始时恢复、每轮结束后保存
    pub transcript_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            persona: default_persona(),
            memory_cap: default_memory_cap(),
            transcript_path: None,
        }
    }
}

fn default_app_name() -> String {
    "duet".to_string()
}

fn default_persona() -> String {
    "Sei Duet, una compagna vocale gentile e concisa. Rispondi in italiano con frasi brevi, adatte alla voce.".to_string()
}

fn default_memory_cap() -> usize {
    20
}

/// [llm] 段：叙述、工具、意图三个后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_conversation_backend")]
    pub conversation: BackendSection,
    #[serde(default = "default_tool_backend")]
    pub tool: BackendSection,
    #[serde(default = "default_intent_backend")]
    pub intent: BackendSection,
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            conversation: default_conversation_backend(),
            tool: default_tool_backend(),
            intent: default_intent_backend(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 单个模型后端；API Key 从 api_key_env 指定的环境变量读取，缺失时回落到 Mock
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// openai（任何 OpenAI 兼容端点）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 是否使用原生 tool calling；关闭时走 prompt 模式
    #[serde(default = "default_true")]
    pub native_tools: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            native_tools: true,
        }
    }
}

impl BackendSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_conversation_backend() -> BackendSection {
    BackendSection {
        model: "gpt-4o".to_string(),
        ..BackendSection::default()
    }
}

fn default_tool_backend() -> BackendSection {
    BackendSection::default()
}

fn default_intent_backend() -> BackendSection {
    BackendSection::default()
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// [tools] 段：工具服务器、超时、并发、排除列表
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerSection>,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 发现阶段每个服务器的超时（秒）
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// 不暴露给 Broker 的工具名
    #[serde(default = "default_excluded_tools")]
    pub excluded_tools: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            tool_timeout_secs: default_tool_timeout_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            excluded_tools: default_excluded_tools(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// 进程内工具（时钟）
    Builtin,
    /// HTTP JSON 工具服务器
    Http,
}

/// [[tools.servers]]
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub kind: ServerKind,
    pub url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_servers() -> Vec<ServerSection> {
    vec![ServerSection {
        name: "builtin".to_string(),
        kind: ServerKind::Builtin,
        url: None,
        enabled: true,
    }]
}

fn default_tool_timeout_secs() -> u64 {
    10
}

fn default_discovery_timeout_secs() -> u64 {
    5
}

fn default_max_in_flight() -> usize {
    3
}

fn default_excluded_tools() -> Vec<String> {
    vec![
        "HassListAddItem".into(),
        "HassListCompleteItem".into(),
        "todo_get_items".into(),
    ]
}

/// [turn] 段：每轮预算与反馈
#[derive(Debug, Clone, Deserialize)]
pub struct TurnSection {
    #[serde(default = "default_max_followups")]
    pub max_followups: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Broker 看到的最近对话条数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_true")]
    pub acknowledgments_enabled: bool,
    /// 为空时使用内置确认语
    #[serde(default)]
    pub acknowledgments: Vec<String>,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            max_followups: default_max_followups(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            history_window: default_history_window(),
            acknowledgments_enabled: true,
            acknowledgments: Vec::new(),
        }
    }
}

fn default_max_followups() -> usize {
    1
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_history_window() -> usize {
    crate::turn::DEFAULT_HISTORY_WINDOW
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntentMethod {
    #[default]
    Keyword,
    Model,
}

/// [intent] 段：分类方式、超时与覆盖规则
#[derive(Debug, Clone, Deserialize)]
pub struct IntentSection {
    #[serde(default)]
    pub method: IntentMethod,
    #[serde(default = "default_intent_timeout_ms")]
    pub timeout_ms: u64,
    /// 置于内置规则表之前，优先匹配
    #[serde(default)]
    pub overrides: Vec<IntentOverride>,
}

impl Default for IntentSection {
    fn default() -> Self {
        Self {
            method: IntentMethod::default(),
            timeout_ms: default_intent_timeout_ms(),
            overrides: Vec::new(),
        }
    }
}

fn default_intent_timeout_ms() -> u64 {
    1500
}

/// [[intent.overrides]]
#[derive(Debug, Clone, Deserialize)]
pub struct IntentOverride {
    pub name: String,
    pub keywords: Vec<String>,
    pub intent: Intent,
    pub family: Option<ToolFamily>,
}

/// 从 config 目录加载配置，环境变量 DUET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DUET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DUET")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
