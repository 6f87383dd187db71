//! 记忆层：有上限的对话记录与持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{AppendOutcome, ConversationMemory, Role, Turn, INTERRUPT_MARKER};
pub use persistence::TranscriptStore;
