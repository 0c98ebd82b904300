//! Provider abstraction, model routing with failover, and HTTP backends.

pub mod compatible;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod provider;
pub(crate) mod retry;
pub mod router;

pub use error::LlmError;
pub use provider::{
    ChatResponse, CompletionRequest, LlmProvider, Message, MessagePart, Role, StopReason,
    ToolDefinition, ToolUseRequest, Usage,
};
pub use router::{ProviderEntry, ProviderRouter};
