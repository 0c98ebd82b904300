use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde_json::Value;

use crate::registry::ToolDef;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// String argument by key, if present.
    #[must_use]
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(Value::as_str)
    }
}

/// Per-call execution context handed to every tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_id: String,
    pub workspace: PathBuf,
    pub extra_roots: Vec<PathBuf>,
}

impl ToolContext {
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            workspace: workspace.into(),
            extra_roots: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_extra_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.extra_roots = roots;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("command blocked by deny pattern `{pattern}`: {command}")]
    Blocked { command: String, pattern: String },

    #[error("path outside workspace: {path}")]
    PathOutsideWorkspace { path: String },

    #[error("url blocked ({reason}): {url}")]
    NetworkBlocked { url: String, reason: String },

    #[error("tool `{tool}` timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("tool `{tool}` denied: {reason}")]
    Denied { tool: String, reason: String },

    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("execution failed: {0}")]
    Execution(#[from] std::io::Error),
}

impl ToolError {
    /// Shorthand for wrapping an arbitrary failure as an execution error.
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Execution(std::io::Error::other(msg.into()))
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A named capability the model can invoke.
///
/// Tools are thin I/O wrappers; safety gating (screening, timeouts, simulation)
/// happens around them in the orchestrator and guards.
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDef;

    /// Run the tool with already-validated input.
    ///
    /// # Errors
    ///
    /// Returns `ToolError` on policy rejection or I/O failure.
    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>>;
}

/// Deserialize tool input into a typed params struct.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` when deserialization fails.
pub fn deserialize_params<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    serde_json::from_value(input.clone()).map_err(|e| ToolError::InvalidParams {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Params {
        path: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    #[test]
    fn deserialize_params_valid() {
        let p: Params = deserialize_params(&json!({"path": "a.txt", "limit": 3})).unwrap();
        assert_eq!(p.path, "a.txt");
        assert_eq!(p.limit, Some(3));
    }

    #[test]
    fn deserialize_params_missing_field() {
        let err = deserialize_params::<Params>(&json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn str_arg_reads_string_only() {
        let call = ToolCall::new("1", "write", json!({"path": "x", "n": 1}));
        assert_eq!(call.str_arg("path"), Some("x"));
        assert_eq!(call.str_arg("n"), None);
        assert_eq!(call.str_arg("missing"), None);
    }

    #[test]
    fn timeout_error_names_tool_and_bound() {
        let err = ToolError::Timeout {
            tool: "exec".into(),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "tool `exec` timed out after 250ms");
    }

    #[test]
    fn context_builder() {
        let ctx = ToolContext::new("a", "s", "/w").with_extra_roots(vec!["/data".into()]);
        assert_eq!(ctx.workspace, PathBuf::from("/w"));
        assert_eq!(ctx.extra_roots.len(), 1);
    }
}
