//! 关键词意图分类
//!
//! 有序的消歧规则表，第一条命中的规则决定结果。单词和短语都用词边界匹配（避免 "ora" 命中 "allora"）。
//! "tempo" 在意大利语里既可以是天气也可以是时间，所以天气短语排在时钟、抽象时间之前。
//! 配置中的覆盖规则插在内置表之前。

use async_trait::async_trait;
use regex::Regex;

use crate::core::AgentError;
use crate::intent::{Classification, Intent, IntentClassifier, Signal};
use crate::memory::Turn;
use crate::tools::ToolFamily;

/// 单个关键词的匹配方式
///
/// 单词和短语都按词边界匹配（"che ora" 不命中 "anche ora"）；边界只加在字母数字一侧。
/// 正则无法构建时退回子串匹配。
#[derive(Debug, Clone)]
pub enum KeywordMatcher {
    Substring(String),
    Bounded { keyword: String, pattern: Regex },
}

impl KeywordMatcher {
    pub fn new(keyword: &str) -> Self {
        let keyword = keyword.trim().to_lowercase();
        let edge = |c: Option<char>| if c.is_some_and(char::is_alphanumeric) { r"\b" } else { "" };
        let source = format!(
            "{}{}{}",
            edge(keyword.chars().next()),
            regex::escape(&keyword),
            edge(keyword.chars().last())
        );
        match Regex::new(&source) {
            Ok(pattern) => KeywordMatcher::Bounded { keyword, pattern },
            Err(_) => KeywordMatcher::Substring(keyword),
        }
    }

    pub fn keyword(&self) -> &str {
        match self {
            KeywordMatcher::Substring(k) => k,
            KeywordMatcher::Bounded { keyword, .. } => keyword,
        }
    }

    /// text 需已转小写
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            KeywordMatcher::Substring(k) => text.contains(k.as_str()),
            KeywordMatcher::Bounded { pattern, .. } => pattern.is_match(text),
        }
    }
}

/// 消歧规则
#[derive(Debug, Clone)]
pub struct DisambiguationRule {
    pub name: String,
    pub keywords: Vec<KeywordMatcher>,
    pub intent: Intent,
    pub family: Option<ToolFamily>,
}

impl DisambiguationRule {
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        keywords: &[S],
        intent: Intent,
        family: Option<ToolFamily>,
    ) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| KeywordMatcher::new(k.as_ref())).collect(),
            intent,
            family,
        }
    }

    fn first_match(&self, text: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|m| m.is_match(text))
            .map(KeywordMatcher::keyword)
    }
}

/// 内置消歧表（意大利语 + 英语）
pub fn builtin_rules() -> Vec<DisambiguationRule> {
    vec![
        DisambiguationRule::new(
            "weather",
            &[
                "che tempo fa", "com'è il tempo", "come è il tempo", "previsioni", "meteo",
                "weather", "forecast", "pioggia", "rain", "nuvole", "clouds",
            ],
            Intent::Tool,
            Some(ToolFamily::Search),
        ),
        DisambiguationRule::new(
            "clock_time",
            &[
                "che ore", "che ora", "ora è", "dimmi l'ora", "orario", "che giorno è",
                "what time", "current time", "what day", "time is it",
            ],
            Intent::Tool,
            Some(ToolFamily::Time),
        ),
        DisambiguationRule::new(
            "abstract_time",
            &[
                "quanto tempo", "tempo libero", "tempo fa", "how long", "free time", "long time",
            ],
            Intent::Direct,
            None,
        ),
        DisambiguationRule::new(
            "device_control",
            &[
                "accendi", "accendere", "spegni", "spegnere", "attiva", "disattiva", "apri",
                "chiudi", "aumenta", "diminuisci", "imposta", "regola", "luce", "luci",
                "lampada", "termostato", "riscaldamento", "condizionatore", "ventilatore",
                "tapparella", "tapparelle", "interruttore", "allarme", "scena", "speaker",
                "cassa", "turn on", "turn off", "switch", "light", "lights", "fan", "thermostat",
                "alarm", "temperatura", "temperature",
            ],
            Intent::Tool,
            Some(ToolFamily::DeviceControl),
        ),
        DisambiguationRule::new(
            "search",
            &[
                "cerca", "trova", "notizie", "ultime", "search", "find", "news", "latest",
                "look up",
            ],
            Intent::Tool,
            Some(ToolFamily::Search),
        ),
        DisambiguationRule::new(
            "tool_keyword",
            &["sveglia", "timer", "promemoria", "reminder", "verifica", "controllare"],
            Intent::Tool,
            None,
        ),
    ]
}

/// 关键词分类器：规则表按顺序匹配，无命中则为 DIRECT
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<DisambiguationRule>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<DisambiguationRule>) -> Self {
        Self { rules }
    }

    /// 覆盖规则优先于内置表
    pub fn with_overrides(overrides: Vec<DisambiguationRule>) -> Self {
        let mut rules = overrides;
        rules.extend(builtin_rules());
        Self { rules }
    }

    pub fn rules(&self) -> &[DisambiguationRule] {
        &self.rules
    }

    /// 第一条命中的规则
    pub fn match_rules(&self, utterance: &str) -> Option<Classification> {
        let text = utterance.to_lowercase();
        self.rules.iter().find_map(|rule| {
            rule.first_match(&text).map(|keyword| Classification {
                intent: rule.intent,
                signal: Signal::Rule {
                    rule: rule.name.clone(),
                    keyword: keyword.to_string(),
                },
                family: rule.family,
            })
        })
    }

    pub fn classify_now(&self, utterance: &str) -> Classification {
        match self.match_rules(utterance) {
            Some(c) => {
                tracing::debug!(intent = ?c.intent, signal = ?c.signal, "keyword intent matched");
                c
            }
            None => Classification::direct(Signal::NoMatch),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(builtin_rules())
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    fn method(&self) -> &'static str {
        "keyword"
    }

    async fn classify(&self, utterance: &str, _history: &[Turn]) -> Result<Classification, AgentError> {
        Ok(self.classify_now(utterance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_name(c: &Classification) -> &str {
        match &c.signal {
            Signal::Rule { rule, .. } => rule,
            _ => "",
        }
    }

    #[test]
    fn test_word_boundary_avoids_substring_hits() {
        let k = KeywordClassifier::default();
        // "allora" 不应命中 "ora"，"lucertola" 不应命中 "luce"
        assert_eq!(k.classify_now("allora, come stai?").intent, Intent::Direct);
        assert_eq!(k.classify_now("ho visto una lucertola").intent, Intent::Direct);
        assert_eq!(k.classify_now("accendi la luce").intent, Intent::Tool);
    }

    #[test]
    fn test_phrases_respect_word_boundaries() {
        let k = KeywordClassifier::default();
        // "ora è" 不应命中 "allora è"，"che ora" 不应命中 "anche ora"
        assert_eq!(k.classify_now("allora è fantastico").intent, Intent::Direct);
        assert_eq!(k.classify_now("anche ora sono stanco").intent, Intent::Direct);
        assert_eq!(rule_name(&k.classify_now("che ora è adesso?")), "clock_time");
        assert_eq!(rule_name(&k.classify_now("com'è il tempo oggi?")), "weather");
    }

    #[test]
    fn test_weather_wins_over_time_overlap() {
        let k = KeywordClassifier::default();
        let c = k.classify_now("che tempo fa a che ora domani?");
        assert_eq!(rule_name(&c), "weather");
        assert_eq!(c.family, Some(ToolFamily::Search));
    }

    #[test]
    fn test_clock_time_without_weather_words() {
        let k = KeywordClassifier::default();
        let c = k.classify_now("che ore sono?");
        assert_eq!(rule_name(&c), "clock_time");
        assert_eq!(c.family, Some(ToolFamily::Time));
    }

    #[test]
    fn test_abstract_time_is_direct() {
        let k = KeywordClassifier::default();
        let c = k.classify_now("quanto tempo ci vuole per imparare?");
        assert_eq!(c.intent, Intent::Direct);
        assert_eq!(rule_name(&c), "abstract_time");
    }

    #[test]
    fn test_override_rule_flips_priority() {
        let k = KeywordClassifier::with_overrides(vec![DisambiguationRule::new(
            "clock_first",
            &["che ora"],
            Intent::Tool,
            Some(ToolFamily::Time),
        )]);
        let c = k.classify_now("che tempo fa a che ora domani?");
        assert_eq!(rule_name(&c), "clock_first");
        assert_eq!(c.family, Some(ToolFamily::Time));
    }

    #[test]
    fn test_plain_chat_no_match() {
        let k = KeywordClassifier::default();
        let c = k.classify_now("ciao, raccontami una barzelletta");
        assert_eq!(c, Classification::direct(Signal::NoMatch));
    }
}
