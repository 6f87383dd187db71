//! 对话持久化
//!
//! 将对话记录写入/从 JSON 文件加载，用于会话重连后恢复（可选使用）。加载后由 ConversationMemory 重新应用上限。

use std::path::{Path, PathBuf};

use crate::memory::{ConversationMemory, Turn};

/// 单文件 JSON 持久化
#[derive(Debug)]
pub struct TranscriptStore {
    path: PathBuf,
}

impl TranscriptStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从 JSON 文件加载；文件不存在时返回空 Vec
    pub fn load(&self) -> anyhow::Result<Vec<Turn>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let turns: Vec<Turn> = serde_json::from_str(&data)?;
        Ok(turns
            .into_iter()
            .filter(|t| !t.content.trim().is_empty())
            .collect())
    }

    /// 加载到指定记忆中，返回因上限淘汰的条数
    pub fn restore_into(&self, memory: &mut ConversationMemory) -> anyhow::Result<usize> {
        let turns = self.load()?;
        tracing::info!(count = turns.len(), path = %self.path.display(), "Loaded transcript");
        Ok(memory.replace(turns))
    }

    /// 写入 JSON 文件；父目录不存在时自动创建
    pub fn save(&self, memory: &ConversationMemory) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&memory.turns())?)?;
        Ok(())
    }
}
