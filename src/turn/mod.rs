//! 单轮编排：Broker 产出调用，Controller 推进续接状态机，Responder 叙述结果

pub mod broker;
pub mod controller;
pub mod events;
pub mod feedback;
pub mod responder;

pub use broker::{followup_directive, parse_text_calls, ToolBroker, DEFAULT_HISTORY_WINDOW};
pub use controller::{
    CallRecord, Completion, ContinuationController, RetryBudget, TurnContext, TurnPolicy, TurnReport, TurnState,
};
pub use events::{EventSink, TurnEvent, TurnEventKind};
pub use feedback::{tool_status, Acknowledger, DEFAULT_ACKNOWLEDGMENTS};
pub use responder::{template_narration, ConversationResponder, Narration, NarrationSource, Sanitizer};
