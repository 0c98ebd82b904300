use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ToolError;

fn default_timeout_ms() -> u64 {
    60_000
}

/// Tools that bound themselves: `exec` takes its own timeout and `ask_agent`
/// races its own deadline.
fn default_overrides() -> HashMap<String, u64> {
    HashMap::from([("exec".to_owned(), 0), ("ask_agent".to_owned(), 0)])
}

/// Per-tool timeout table. A value of `0` disables the framework timeout for
/// that tool; the tool is then responsible for bounding itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTimeouts {
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,
    #[serde(default = "default_overrides")]
    pub overrides: HashMap<String, u64>,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            overrides: default_overrides(),
        }
    }
}

impl ToolTimeouts {
    #[must_use]
    pub fn with_override(mut self, tool: impl Into<String>, ms: u64) -> Self {
        self.overrides.insert(tool.into(), ms);
        self
    }

    /// Effective deadline for `tool`, or `None` when the framework must not interrupt it.
    #[must_use]
    pub fn effective(&self, tool: &str) -> Option<Duration> {
        let ms = self.overrides.get(tool).copied().unwrap_or(self.default_ms);
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

/// Parse a timeout given as a string of milliseconds.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` for anything that is not a non-negative integer.
pub fn parse_timeout_ms(raw: &str) -> Result<u64, ToolError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ToolError::InvalidParams {
            message: format!("malformed timeout `{raw}`: expected milliseconds"),
        })
}

/// Race `fut` against `timeout`. The losing branch is dropped; a tool that owns
/// external resources must release them on drop.
///
/// # Errors
///
/// Returns `ToolError::Timeout` naming the tool and the bound when the deadline
/// fires first, otherwise whatever `fut` returns.
pub async fn run_with_timeout<F, T>(
    tool: &str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, ToolError>
where
    F: Future<Output = Result<T, ToolError>>,
{
    let Some(limit) = timeout else {
        return fut.await;
    };
    tokio::pin!(fut);
    tokio::select! {
        biased;
        res = &mut fut => res,
        () = tokio::time::sleep(limit) => {
            let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(tool, timeout_ms, "tool call timed out");
            Err(ToolError::Timeout {
                tool: tool.to_owned(),
                timeout_ms,
            })
        }
    }
}
