//! 小模型意图分类
//!
//! 用简短的分类 prompt 让快速模型回答 TOOL 或 CONVERSATION；回答中出现 "TOOL" 即为工具意图。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::intent::{Classification, IntentClassifier, Signal};
use crate::llm::{collect_reply, ModelBackend, ModelRequest};
use crate::memory::Turn;

const CLASSIFICATION_PROMPT: &str = "\
Classify the user input as CONVERSATION or TOOL. Answer with one word.

CONVERSATION: greetings, chit-chat, questions about you, stories, jokes, general knowledge.
TOOL: controlling smart home devices, searching current information (weather, news), \
checking the current time or date, any live data you cannot know.

Italian \"tempo\" is ambiguous:
- \"che tempo fa\", \"previsioni del tempo\" ask for the weather: TOOL
- \"quanto tempo ci vuole\", \"tempo libero\" are about time as a concept: CONVERSATION
- \"che ore sono\", \"che ora è\", \"dimmi l'ora\" ask for the clock: TOOL

If unsure: CONVERSATION";

pub struct ModelIntentClassifier {
    backend: Arc<dyn ModelBackend>,
    timeout: Duration,
}

impl ModelIntentClassifier {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

/// 回答中含 "TOOL"（不区分大小写）即为工具意图
pub fn parse_answer(answer: &str) -> bool {
    answer.trim().to_uppercase().contains("TOOL")
}

#[async_trait]
impl IntentClassifier for ModelIntentClassifier {
    fn method(&self) -> &'static str {
        "model"
    }

    async fn classify(&self, utterance: &str, _history: &[Turn]) -> Result<Classification, AgentError> {
        let request = ModelRequest::new(CLASSIFICATION_PROMPT, vec![Turn::user(utterance)]);
        let reply = collect_reply(
            self.backend.as_ref(),
            request,
            &CancellationToken::new(),
            self.timeout,
            |_| {},
        )
        .await?;
        let answer = reply.text.trim().to_string();
        let signal = Signal::Model {
            answer: answer.clone(),
        };
        if parse_answer(&answer) {
            tracing::info!(utterance = %utterance, "intent classified as TOOL");
            Ok(Classification::tool(signal, None))
        } else {
            tracing::debug!(utterance = %utterance, "intent classified as CONVERSATION");
            Ok(Classification::direct(signal))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use crate::llm::{LlmError, ScriptedBackend, ScriptedReply};

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("TOOL"));
        assert!(parse_answer(" tool\n"));
        assert!(!parse_answer("CONVERSATION"));
        assert!(!parse_answer(""));
    }

    #[tokio::test]
    async fn test_model_classifier_sends_utterance_only() {
        let backend = Arc::new(ScriptedBackend::new([ScriptedReply::text("CONVERSATION")]));
        let classifier = ModelIntentClassifier::new(backend.clone(), Duration::from_secs(1));
        let c = classifier.classify("ciao", &[Turn::user("prima")]).await.unwrap();
        assert_eq!(c.intent, Intent::Direct);
        let requests = backend.requests();
        assert_eq!(requests[0].turns.len(), 1);
        assert!(requests[0].tools.is_none());
    }

    #[tokio::test]
    async fn test_model_error_propagates() {
        let backend = Arc::new(ScriptedBackend::new([ScriptedReply::Fail(LlmError::Api(
            "boom".into(),
        ))]));
        let classifier = ModelIntentClassifier::new(backend, Duration::from_secs(1));
        assert!(classifier.classify("ciao", &[]).await.is_err());
    }
}
