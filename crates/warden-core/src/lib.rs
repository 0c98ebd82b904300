//! Turn pipeline, plugin hooks, configuration loading, and the cross-agent bus.

pub mod background;
pub mod config;
pub mod config_watcher;
pub mod cost;
pub mod distill;
pub mod error;
pub mod events;
pub mod guard;
pub mod hooks;
pub mod mailbox;
pub mod pipeline;
pub mod retention;

pub use config::Config;
pub use config_watcher::{ConfigEvent, ConfigWatcher};
pub use cost::CostTracker;
pub use error::PipelineError;
pub use events::{TurnEvent, TurnEventStream};
pub use guard::{GuardVerdict, InputGuard};
pub use hooks::{HookEvent, Plugin, PluginApi, PluginHookBus};
pub use mailbox::{AgentBus, AskAgentTool, SendMessageTool, TurnDispatcher};
pub use pipeline::{InboundMessage, SenderKind, TurnOutcome, TurnPipeline};
