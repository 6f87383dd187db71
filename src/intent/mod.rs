//! 意图路由
//!
//! 把每条用户输入标为 DIRECT（直接对话）或 TOOL（需要工具）。两种实现：关键词规则表（低延迟、确定性）
//! 与小模型分类（简短分类 prompt）。IntentRouter 为分类施加超时：超时或分类失败一律回落到 DIRECT。

pub mod keyword;
pub mod model;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Turn;
use crate::tools::ToolFamily;

pub use keyword::{DisambiguationRule, KeywordClassifier, KeywordMatcher};
pub use model::ModelIntentClassifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Direct,
    Tool,
}

/// 命中的信号（诊断用）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// 规则表中的某条规则
    Rule { rule: String, keyword: String },
    /// 模型分类的原始回答
    Model { answer: String },
    /// 上游强制
    Forced,
    NoMatch,
    Timeout,
    Failed { reason: String },
}

/// 分类结果：意图 + 信号 + 可选工具类别（用于收窄工具枚举）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub signal: Signal,
    pub family: Option<ToolFamily>,
}

impl Classification {
    pub fn direct(signal: Signal) -> Self {
        Self {
            intent: Intent::Direct,
            signal,
            family: None,
        }
    }

    pub fn tool(signal: Signal, family: Option<ToolFamily>) -> Self {
        Self {
            intent: Intent::Tool,
            signal,
            family,
        }
    }

    pub fn is_tool(&self) -> bool {
        self.intent == Intent::Tool
    }

    /// 交给 Broker 的工具类别范围；空表示全部工具。搜索类查询附带时间工具。
    pub fn tool_scope(&self) -> Vec<ToolFamily> {
        match self.family {
            Some(ToolFamily::Search) => vec![ToolFamily::Search, ToolFamily::Time],
            Some(ToolFamily::Time) => vec![ToolFamily::Time],
            _ => Vec::new(),
        }
    }
}

/// 上游路由提示
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingHints {
    /// 跳过分类，直接使用该意图
    #[serde(default)]
    pub force_intent: Option<Intent>,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    fn method(&self) -> &'static str;

    async fn classify(&self, utterance: &str, history: &[Turn]) -> Result<Classification, AgentError>;
}

/// 带超时的意图路由器
pub struct IntentRouter {
    classifier: Arc<dyn IntentClassifier>,
    /// 模型分类只给出 TOOL/DIRECT，工具类别由规则表补充
    scoper: Option<KeywordClassifier>,
    timeout: Duration,
}

impl IntentRouter {
    pub fn new(classifier: Arc<dyn IntentClassifier>, timeout: Duration) -> Self {
        Self {
            classifier,
            scoper: None,
            timeout,
        }
    }

    pub fn with_scoper(mut self, scoper: KeywordClassifier) -> Self {
        self.scoper = Some(scoper);
        self
    }

    pub fn method(&self) -> &'static str {
        self.classifier.method()
    }

    pub async fn route(&self, utterance: &str, history: &[Turn], hints: &RoutingHints) -> Classification {
        if let Some(intent) = hints.force_intent {
            let family = self
                .scoper
                .as_ref()
                .and_then(|s| s.match_rules(utterance))
                .and_then(|c| c.family);
            return Classification {
                intent,
                signal: Signal::Forced,
                family: if intent == Intent::Tool { family } else { None },
            };
        }

        let classified = match tokio::time::timeout(self.timeout, self.classifier.classify(utterance, history)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, method = self.method(), "intent classification failed, routing direct");
                Classification::direct(Signal::Failed { reason: e.to_string() })
            }
            Err(_) => {
                tracing::warn!(
                    error = %AgentError::ClassificationTimeout,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "routing direct"
                );
                Classification::direct(Signal::Timeout)
            }
        };

        if classified.is_tool() && classified.family.is_none() {
            if let Some(family) = self
                .scoper
                .as_ref()
                .and_then(|s| s.match_rules(utterance))
                .and_then(|c| c.family)
            {
                return Classification {
                    family: Some(family),
                    ..classified
                };
            }
        }
        classified
    }
}
