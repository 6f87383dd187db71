//! 模型层：后端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockBackend, ScriptedBackend, ScriptedReply};
pub use openai::OpenAiBackend;
pub use traits::{
    collect_reply, LlmError, ModelBackend, ModelEvent, ModelReply, ModelRequest, ModelStream,
    ProposedCall,
};
