use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::batch::ParallelPolicy;
use crate::executor::{BoxFuture, Tool, ToolContext, ToolError, deserialize_params};
use crate::registry::ToolDef;
use crate::sandbox::Sandbox;

/// Built-in deny patterns, checked in order before any user-supplied ones.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    // recursive root / home deletion
    "*rm -rf /",
    "*rm -rf / *",
    "*rm -rf /[*]",
    "*rm -fr /",
    "*rm -rf ~",
    "*rm -rf ~/",
    // privilege escalation
    "*sudo *",
    "su",
    "su -*",
    "*doas *",
    // setuid
    "*chmod *+s *",
    "*chmod 4??? *",
    // filesystem format and raw device writes
    "*mkfs*",
    "*dd *of=/dev/*",
    "*> /dev/sd*",
    // power state
    "*shutdown*",
    "*reboot*",
    "*poweroff*",
    "*halt",
    "*init 0*",
    // service control
    "*systemctl stop *",
    "*systemctl disable *",
    "*systemctl mask *",
    // fork bomb
    ":(){ :|:& };:",
    "*:(){ :|:& };:*",
    // remote download piped into a shell
    "*curl *|*sh*",
    "*wget *|*sh*",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Ordered glob deny-list run against every shell command before execution.
#[derive(Debug, Clone)]
pub struct CommandScreen {
    patterns: Vec<(String, Pattern)>,
}

impl Default for CommandScreen {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl CommandScreen {
    /// Built-in patterns followed by `extra`. Invalid globs are skipped with a warning.
    #[must_use]
    pub fn new(extra: &[String]) -> Self {
        let patterns = DEFAULT_DENY_PATTERNS
            .iter()
            .map(|p| (*p).to_owned())
            .chain(extra.iter().cloned())
            .filter_map(|raw| {
                let normalized = normalize(&raw);
                match Pattern::new(&normalized) {
                    Ok(p) => Some((raw, p)),
                    Err(e) => {
                        tracing::warn!(pattern = %raw, error = %e, "ignoring invalid deny pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// # Errors
    ///
    /// Returns `ToolError::Blocked` naming the first matching pattern.
    pub fn screen(&self, command: &str) -> Result<(), ToolError> {
        let normalized = normalize(command);
        if let Some((raw, _)) = self
            .patterns
            .iter()
            .find(|(_, p)| p.matches_with(&normalized, MATCH_OPTIONS))
        {
            tracing::warn!(command = %normalized, pattern = %raw, "command blocked");
            return Err(ToolError::Blocked {
                command: normalized,
                pattern: raw.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Flatten into the string handed back to the model.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("[stderr] ");
            out.push_str(&self.stderr);
        }
        match self.exit_code {
            Some(0) => {}
            Some(code) => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&format!("[exit code {code}]"));
            }
            None => out.push_str("\n[terminated by signal]"),
        }
        if out.is_empty() {
            "(no output)".to_owned()
        } else {
            out
        }
    }
}

/// Spawn `program` and wait up to `timeout`. The child is killed when the
/// deadline passes or the future is dropped.
///
/// # Errors
///
/// Returns `ToolError::Execution` if the process cannot be spawned and
/// `ToolError::Timeout` when the deadline passes.
pub async fn run_process(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let child = cmd.spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            })
        }
        Err(_) => Err(ToolError::Timeout {
            tool: program.to_owned(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecParams {
    /// Shell command to run with `bash -c` inside the workspace.
    pub command: String,
    /// Optional timeout in milliseconds, capped by the tool's own maximum.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `exec`: screened shell execution, sandboxed when an isolation backend exists.
#[derive(Debug)]
pub struct ExecTool {
    screen: Arc<CommandScreen>,
    sandbox: Option<Arc<Sandbox>>,
    max_timeout: Duration,
}

impl ExecTool {
    #[must_use]
    pub fn new(screen: Arc<CommandScreen>, max_timeout: Duration) -> Self {
        Self {
            screen,
            sandbox: None,
            max_timeout,
        }
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    async fn run(&self, params: ExecParams, ctx: &ToolContext) -> Result<String, ToolError> {
        self.screen.screen(&params.command)?;
        let timeout = params
            .timeout_ms
            .map_or(self.max_timeout, Duration::from_millis)
            .min(self.max_timeout);

        if let Some(sandbox) = &self.sandbox {
            if sandbox.is_available().await {
                tracing::debug!(agent = %ctx.agent_id, "running command in sandbox");
                let output = sandbox
                    .run(&params.command, &ctx.workspace, timeout)
                    .await?;
                return Ok(output.render());
            }
            sandbox.note_degraded();
        }

        let args = vec!["-c".to_owned(), params.command];
        let output = run_process("bash", &args, Some(&ctx.workspace), timeout)
            .await
            .map_err(|e| match e {
                ToolError::Timeout { timeout_ms, .. } => ToolError::Timeout {
                    tool: "exec".into(),
                    timeout_ms,
                },
                other => other,
            })?;
        Ok(output.render())
    }
}

impl Tool for ExecTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<ExecParams>(
            "exec",
            "Run a shell command in the agent workspace and return its output.",
            ParallelPolicy::NEVER,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move {
            let params: ExecParams = deserialize_params(input)?;
            self.run(params, ctx).await
        })
    }
}
