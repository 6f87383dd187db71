//! Conversation Responder：最终叙述
//!
//! 拿完整对话记忆与本轮汇总的工具结果，用人设 prompt 生成自然语言回复并流式推送。
//! 叙述只依据最后一条（可执行的）结果；失败如实说明；不暴露工具名、调用 id 等内部标识。
//! 工具已经执行但叙述模型失败时，退回模板叙述。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{collect_reply, ModelBackend, ModelRequest};
use crate::memory::{Role, Turn};
use crate::turn::controller::{Completion, TurnReport};
use crate::turn::events::{EventSink, TurnEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationSource {
    Model,
    Template,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Narration {
    pub text: String,
    pub source: NarrationSource,
}

pub struct ConversationResponder {
    backend: Arc<dyn ModelBackend>,
    persona: String,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl ConversationResponder {
    pub fn new(backend: Arc<dyn ModelBackend>, persona: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            persona: persona.into(),
            timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// history 为完整记忆（首条 system 视为人设）；hidden 为需要从输出中去掉的内部标识
    pub async fn narrate(
        &self,
        history: &[Turn],
        report: Option<&TurnReport>,
        hidden: &[String],
        turn_id: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Narration, AgentError> {
        let mut hidden: Vec<String> = hidden.iter().filter(|h| is_identifier(h)).cloned().collect();
        if let Some(r) = report {
            hidden.extend(r.records.iter().map(|rec| rec.call.id.clone()));
        }
        let sanitizer = Sanitizer::new(hidden);

        let (persona, turns) = match history.first() {
            Some(first) if first.role == Role::System => (first.content.as_str(), &history[1..]),
            _ => (self.persona.as_str(), history),
        };
        let mut system = persona.to_string();
        if let Some(r) = report.filter(|r| !r.records.is_empty()) {
            system.push_str("\n\n");
            system.push_str(&self.guidance(r, &sanitizer));
        }

        let request = ModelRequest::new(system, turns.to_vec());
        let mut stream = sanitizer.stream();
        let reply = collect_reply(self.backend.as_ref(), request, cancel, self.timeout, |delta| {
            if let Some(chunk) = stream.push(delta) {
                events.send(turn_id, TurnEventKind::NarrationChunk { text: chunk });
            }
        })
        .await;

        match reply {
            Ok(reply) => {
                if let Some(rest) = stream.finish() {
                    events.send(turn_id, TurnEventKind::NarrationChunk { text: rest });
                }
                events.send(turn_id, TurnEventKind::NarrationDone);
                Ok(Narration {
                    text: sanitizer.clean(&reply.text),
                    source: NarrationSource::Model,
                })
            }
            Err(e) => {
                let err = AgentError::from(e);
                if err == AgentError::Cancelled {
                    return Err(err);
                }
                match report.filter(|r| !r.records.is_empty()) {
                    Some(r) => {
                        tracing::warn!(turn_id, error = %err, "narration model failed, using template");
                        let text = template_narration(r);
                        events.send(turn_id, TurnEventKind::NarrationChunk { text: text.clone() });
                        events.send(turn_id, TurnEventKind::NarrationDone);
                        Ok(Narration {
                            text,
                            source: NarrationSource::Template,
                        })
                    }
                    None => Err(AgentError::BackendUnavailable(format!(
                        "{}: {err}",
                        self.backend.name()
                    ))),
                }
            }
        }
    }

    /// 本轮工具结果的说明段；步骤只标 lookup / action，不写工具名
    fn guidance(&self, report: &TurnReport, sanitizer: &Sanitizer) -> String {
        let mut out = String::from("## Results gathered for this request\n");
        for (i, rec) in report.records.iter().enumerate() {
            let kind = if rec.discovery { "lookup" } else { "action" };
            out.push_str(&format!(
                "Step {} ({kind}): {}\n",
                i + 1,
                sanitizer.clean(&rec.result.content)
            ));
        }
        out.push_str(
            "\nRules:\n\
             - Base your reply strictly on the LAST step. Earlier steps were only preparation.\n\
             - A result starting with \"Error:\" means the step failed. Say so honestly and never claim success.\n\
             - Never mention lookups, tools, function names or ids. Speak naturally and briefly.\n",
        );
        match &report.completion {
            Completion::FollowupExhausted => out.push_str(
                "- The request could only be partially completed: report what was found and say the rest was not done.\n",
            ),
            Completion::Failed(err) => {
                out.push_str("- The request could not be completed. Tell the user plainly.\n");
                if let RecoveryAction::Narrate(hint) = self.recovery.handle(err) {
                    out.push_str(&format!(
                        "- Reason: {}. If information is missing, ask the user for it.\n",
                        sanitizer.clean(&hint)
                    ));
                }
            }
            _ => {}
        }
        out
    }
}

/// 看起来像内部标识才需要隐藏（含 `_`、数字或词中大写），避免误删普通单词
fn is_identifier(s: &str) -> bool {
    s.chars().count() >= 4
        && (s.contains('_')
            || s.chars().any(|c| c.is_ascii_digit())
            || s.chars().skip(1).any(|c| c.is_uppercase()))
}

/// 模型不可用时的模板叙述
pub fn template_narration(report: &TurnReport) -> String {
    let Some(last) = report.final_record() else {
        return "Non ho trovato niente da fare.".to_string();
    };
    match &report.completion {
        Completion::FollowupExhausted => {
            "Ho controllato, ma non sono riuscito a completare la richiesta.".to_string()
        }
        Completion::Cancelled => "Va bene, lascio perdere.".to_string(),
        _ if last.result.success && last.discovery => {
            format!("Ecco cosa ho trovato: {}", last.result.content)
        }
        _ if last.result.success => "Fatto!".to_string(),
        _ => match last.result.failure.as_ref() {
            Some(AgentError::Rejected(_)) => {
                "Mi servono più dettagli per farlo. Puoi dirmi esattamente cosa intendi?".to_string()
            }
            Some(AgentError::ToolTimeout { .. }) => {
                "Mi dispiace, il servizio non ha risposto in tempo.".to_string()
            }
            Some(AgentError::ToolServerUnreachable { .. }) => {
                "Mi dispiace, il servizio non è raggiungibile in questo momento.".to_string()
            }
            _ => "Mi dispiace, si è verificato un errore e non ci sono riuscito.".to_string(),
        },
    }
}

/// 确定性的标识过滤：整段清理，或流式时保留可能被截断的尾部
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    hidden: Vec<String>,
}

impl Sanitizer {
    pub fn new(mut hidden: Vec<String>) -> Self {
        hidden.retain(|h| !h.is_empty());
        // 长的先替换，避免前缀相同的短名残留
        hidden.sort_by_key(|h| std::cmp::Reverse(h.len()));
        hidden.dedup();
        Self { hidden }
    }

    pub fn clean(&self, text: &str) -> String {
        let mut out = text.to_string();
        for h in &self.hidden {
            if out.contains(h.as_str()) {
                out = out.replace(h.as_str(), "");
            }
        }
        while out.contains("  ") {
            out = out.replace("  ", " ");
        }
        out
    }

    pub fn stream(&self) -> StreamSanitizer<'_> {
        let hold = self
            .hidden
            .iter()
            .map(|h| h.chars().count())
            .max()
            .unwrap_or(1)
            .saturating_sub(1);
        StreamSanitizer {
            inner: self,
            pending: String::new(),
            hold,
        }
    }
}

pub struct StreamSanitizer<'a> {
    inner: &'a Sanitizer,
    pending: String,
    /// 末尾保留的字符数（最长标识长度减一）
    hold: usize,
}

impl StreamSanitizer<'_> {
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.pending.push_str(delta);
        let cleaned = self.inner.clean(&self.pending);
        let total = cleaned.chars().count();
        if total <= self.hold {
            self.pending = cleaned;
            return None;
        }
        let split = cleaned
            .char_indices()
            .nth(total - self.hold)
            .map(|(i, _)| i)
            .unwrap_or(cleaned.len());
        let (ready, rest) = cleaned.split_at(split);
        let ready = ready.to_string();
        self.pending = rest.to_string();
        Some(ready).filter(|s| !s.is_empty())
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = self.inner.clean(&std::mem::take(&mut self.pending));
        Some(rest).filter(|s| !s.is_empty())
    }
}
