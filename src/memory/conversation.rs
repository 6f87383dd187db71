//! 短期记忆：对话记录
//!
//! 有序、有上限的 Turn 序列。首条 system turn（人设）永不淘汰；超出上限时从最旧的非 system turn 开始剪枝。
//! Turn 追加后不可修改，中断时以追加新 turn 的方式记录「听到的部分」。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户中断后追加的占位内容
pub const INTERRUPT_MARKER: &str = "[Interrupted by user]";

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条对话记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// push 的结果：是否写入、因上限淘汰了几条
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub appended: bool,
    pub evicted: usize,
}

/// 短期记忆：最多 cap 条 Turn
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    cap: usize,
}

impl ConversationMemory {
    /// cap 至少为 1
    pub fn new(cap: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// 以人设 system turn 开头
    pub fn with_system(cap: usize, system: impl Into<String>) -> Self {
        let mut memory = Self::new(cap);
        memory.push(Turn::system(system));
        memory
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// 首条 system turn（若存在）
    pub fn lead_system(&self) -> Option<&Turn> {
        self.turns.front().filter(|t| t.role == Role::System)
    }

    /// 追加一条 turn；与最后一条 role + content 完全相同时忽略。超出上限时静默淘汰。
    pub fn push(&mut self, turn: Turn) -> AppendOutcome {
        if let Some(last) = self.turns.back() {
            if last.role == turn.role && last.content == turn.content {
                return AppendOutcome::default();
            }
        }
        self.turns.push_back(turn);
        let evicted = self.prune();
        if evicted > 0 {
            tracing::debug!(evicted, cap = self.cap, "conversation memory pruned");
        }
        AppendOutcome {
            appended: true,
            evicted,
        }
    }

    /// 最近 n 条非 system turn（Tool Broker 的有限窗口）
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let mut window: Vec<Turn> = self
            .turns
            .iter()
            .rev()
            .filter(|t| t.role != Role::System)
            .take(n)
            .cloned()
            .collect();
        window.reverse();
        window
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }

    /// 用户打断：记录已播报的部分（加 "..."）与中断标记
    pub fn interrupt(&mut self, heard_response: &str) {
        let heard = heard_response.trim();
        if !heard.is_empty() {
            self.push(Turn::assistant(format!("{heard}...")));
        }
        self.push(Turn::user(INTERRUPT_MARKER));
    }

    /// 清空对话，保留首条 system turn
    pub fn clear(&mut self) {
        let lead = self.lead_system().cloned();
        self.turns.clear();
        if let Some(lead) = lead {
            self.turns.push_back(lead);
        }
    }

    /// 替换全部记录（从持久化恢复），并重新应用上限
    pub fn replace(&mut self, turns: Vec<Turn>) -> usize {
        self.turns = turns.into();
        self.prune()
    }

    /// 淘汰顺序：最旧的非 system turn；若只剩 system turn，则淘汰首条之外最旧的 system turn
    fn prune(&mut self) -> usize {
        let mut evicted = 0;
        while self.turns.len() > self.cap {
            let pinned = usize::from(self.lead_system().is_some());
            let victim = self
                .turns
                .iter()
                .enumerate()
                .skip(pinned)
                .find(|(_, t)| t.role != Role::System)
                .map(|(i, _)| i)
                .or_else(|| (self.turns.len() > pinned).then_some(pinned));
            match victim {
                Some(i) => {
                    self.turns.remove(i);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_never_exceeded_and_lead_system_kept() {
        let mut memory = ConversationMemory::with_system(4, "persona");
        for i in 0..10 {
            memory.push(Turn::user(format!("u{i}")));
            assert!(memory.len() <= 4);
        }
        assert_eq!(memory.lead_system().map(|t| t.content.as_str()), Some("persona"));
        let contents: Vec<_> = memory.iter().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["persona", "u7", "u8", "u9"]);
    }

    #[test]
    fn test_duplicate_turn_ignored() {
        let mut memory = ConversationMemory::new(10);
        assert!(memory.push(Turn::user("ciao")).appended);
        assert!(!memory.push(Turn::user("ciao")).appended);
        assert!(memory.push(Turn::assistant("ciao")).appended);
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn test_recent_window_skips_system() {
        let mut memory = ConversationMemory::with_system(10, "persona");
        memory.push(Turn::user("a"));
        memory.push(Turn::assistant("b"));
        memory.push(Turn::user("c"));
        let window = memory.recent(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "b");
        assert_eq!(window[1].content, "c");
    }

    #[test]
    fn test_interrupt_appends_heard_and_marker() {
        let mut memory = ConversationMemory::new(10);
        memory.push(Turn::user("raccontami una storia"));
        memory.interrupt("C'era una volta");
        let turns = memory.turns();
        assert_eq!(turns[1].content, "C'era una volta...");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].content, INTERRUPT_MARKER);
    }

    #[test]
    fn test_only_system_turns_still_respect_cap() {
        let mut memory = ConversationMemory::with_system(2, "persona");
        memory.push(Turn::system("note 1"));
        memory.push(Turn::system("note 2"));
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.lead_system().map(|t| t.content.as_str()), Some("persona"));
    }

    #[test]
    fn test_clear_keeps_lead_system() {
        let mut memory = ConversationMemory::with_system(5, "persona");
        memory.push(Turn::user("x"));
        memory.clear();
        assert_eq!(memory.len(), 1);
        assert!(memory.lead_system().is_some());
    }
}
