pub mod clock;
pub mod descriptor;
pub mod executor;
pub mod http;
pub mod local;
pub mod registry;
pub mod schema;
pub mod server;
pub mod validator;

pub use clock::CurrentTimeTool;
pub use descriptor::{EffectClass, ToolCall, ToolDescriptor, ToolFamily, ToolResult};
pub use executor::ToolExecutor;
pub use http::HttpToolServer;
pub use local::{LocalToolServer, Tool};
pub use registry::{DegradedServer, DiscoveryReport, ToolRegistry, NAMESPACE_SEPARATOR};
pub use schema::{tool_call_schema_json, tools_prompt_section, ToolCallFormat};
pub use server::{RemoteTool, ServerError, ToolServer};
pub use validator::{looks_time_shaped, validate, validate_against, Rejection};
