//! Tool contract, orchestration primitives, execution guards, and the audit chain.

pub mod audit;
pub mod batch;
pub mod config;
pub mod executor;
pub mod fetch;
pub mod file;
pub mod network;
pub mod path_guard;
pub mod registry;
pub mod reversibility;
pub mod sandbox;
pub mod shell;
pub mod timeout;
pub mod truncate;

use std::sync::Arc;
use std::time::Duration;

pub use audit::{
    AuditChain, AuditEntry, AuditError, AuditRecord, AuditStore, AuditVerification,
    InMemoryAuditStore,
};
pub use batch::{ParallelPolicy, Parallelism, ToolBatch, plan_batches};
pub use config::{FetchConfig, ShellConfig, ToolsConfig};
pub use executor::{BoxFuture, Tool, ToolCall, ToolContext, ToolError};
pub use network::{NetworkGuard, ResolvedUrl};
pub use path_guard::safe_path;
pub use registry::{ToolDef, ToolRegistry};
pub use reversibility::{Reversibility, SimulationVerdict, Simulator};
pub use sandbox::{Sandbox, SandboxConfig};
pub use shell::CommandScreen;
pub use timeout::{ToolTimeouts, run_with_timeout};
pub use truncate::{OutputLimits, truncate_for_context, truncate_for_storage};

/// Register `read`, `list`, `write`, and, when enabled, `exec` and `web_fetch`.
pub fn register_builtin_tools(registry: &mut ToolRegistry, config: &ToolsConfig) {
    registry.register(Arc::new(file::ReadTool));
    registry.register(Arc::new(file::ListTool));
    registry.register(Arc::new(file::WriteTool));

    if config.shell.enabled {
        let screen = Arc::new(CommandScreen::new(&config.shell.deny_patterns));
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()));
        let exec = shell::ExecTool::new(
            screen,
            Duration::from_secs(config.shell.max_timeout_secs),
        )
        .with_sandbox(sandbox);
        registry.register(Arc::new(exec));
    }
    if config.fetch.enabled {
        registry.register(Arc::new(fetch::WebFetchTool::new(&config.fetch)));
    }
}
