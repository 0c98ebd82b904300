//! Container isolation for shell commands.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::executor::ToolError;
use crate::shell::{CommandOutput, run_process};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTAINER_WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    fn flag(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

fn default_runtime() -> String {
    "docker".into()
}

fn default_image() -> String {
    "debian:stable-slim".into()
}

fn default_memory() -> String {
    "512m".into()
}

fn default_cpus() -> String {
    "1.0".into()
}

fn default_scratch() -> String {
    "64m".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: String,
    #[serde(default = "default_scratch")]
    pub scratch_size: String,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub workspace_mount: MountMode,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime: default_runtime(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            scratch_size: default_scratch(),
            allow_network: false,
            workspace_mount: MountMode::default(),
        }
    }
}

/// One ephemeral container per command. Backend availability is probed once
/// per instance; degradation to screening-only is logged once per instance.
#[derive(Debug)]
pub struct Sandbox {
    config: SandboxConfig,
    available: OnceCell<bool>,
    degraded_logged: AtomicBool,
}

impl Sandbox {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            available: OnceCell::new(),
            degraded_logged: AtomicBool::new(false),
        }
    }

    /// Skip probing and treat the backend as present or absent.
    #[must_use]
    pub fn with_known_availability(config: SandboxConfig, available: bool) -> Self {
        Self {
            config,
            available: OnceCell::new_with(Some(available)),
            degraded_logged: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub async fn is_available(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        *self
            .available
            .get_or_init(|| probe_runtime(&self.config.runtime))
            .await
    }

    /// Record that a command ran without isolation. Logs only the first time.
    pub fn note_degraded(&self) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                runtime = %self.config.runtime,
                "sandbox backend unavailable, falling back to command screening only"
            );
        }
    }

    #[must_use]
    pub fn has_logged_degradation(&self) -> bool {
        self.degraded_logged.load(Ordering::Relaxed)
    }

    /// Full argument list for the container runtime.
    #[must_use]
    pub fn docker_args(&self, command: &str, workspace: &Path) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "run".to_owned(),
            "--rm".into(),
            "--read-only".into(),
            "--user".into(),
            "65534:65534".into(),
            "--memory".into(),
            c.memory.clone(),
            "--cpus".into(),
            c.cpus.clone(),
            "--pids-limit".into(),
            "256".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}", c.scratch_size),
        ];
        if !c.allow_network {
            args.push("--network".into());
            args.push("none".into());
        }
        args.push("-v".into());
        args.push(format!(
            "{}:{CONTAINER_WORKSPACE}:{}",
            workspace.display(),
            c.workspace_mount.flag()
        ));
        args.push("-w".into());
        args.push(CONTAINER_WORKSPACE.into());
        args.push(c.image.clone());
        args.push("sh".into());
        args.push("-c".into());
        args.push(command.to_owned());
        args
    }

    /// Run an already-screened command inside a fresh container.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Execution` if the runtime cannot start and
    /// `ToolError::Timeout` if the command outlives `timeout`.
    pub async fn run(
        &self,
        command: &str,
        workspace: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, ToolError> {
        let args = self.docker_args(command, workspace);
        run_process(&self.config.runtime, &args, None, timeout)
            .await
            .map_err(|e| match e {
                ToolError::Timeout { timeout_ms, .. } => ToolError::Timeout {
                    tool: "exec".into(),
                    timeout_ms,
                },
                other => other,
            })
    }
}

async fn probe_runtime(runtime: &str) -> bool {
    let status = Command::new(runtime)
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    let ok = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, status).await,
        Ok(Ok(s)) if s.success()
    );
    tracing::info!(runtime, available = ok, "sandbox backend probed");
    ok
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn enabled() -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn args_apply_isolation_defaults() {
        let sb = Sandbox::new(enabled());
        let args = sb.docker_args("echo hi", &PathBuf::from("/w"));
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --read-only --user 65534:65534"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1.0"));
        assert!(joined.contains("--tmpfs /tmp:rw,noexec,nosuid"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("-v /w:/workspace:ro"));
        assert_eq!(args.last().map(String::as_str), Some("echo hi"));
    }

    #[test]
    fn args_respect_network_and_mount_mode() {
        let sb = Sandbox::new(SandboxConfig {
            allow_network: true,
            workspace_mount: MountMode::ReadWrite,
            ..enabled()
        });
        let joined = sb.docker_args("ls", &PathBuf::from("/w")).join(" ");
        assert!(!joined.contains("--network none"));
        assert!(joined.contains("/w:/workspace:rw"));
    }

    #[tokio::test]
    async fn disabled_is_never_available() {
        let sb = Sandbox::with_known_availability(SandboxConfig::default(), true);
        assert!(!sb.is_available().await);
    }

    #[tokio::test]
    async fn known_availability_skips_probe() {
        let sb = Sandbox::with_known_availability(enabled(), false);
        assert!(!sb.is_available().await);
        let sb = Sandbox::with_known_availability(enabled(), true);
        assert!(sb.is_available().await);
    }

    #[tokio::test]
    async fn missing_runtime_probes_unavailable() {
        let sb = Sandbox::new(SandboxConfig {
            runtime: "warden-no-such-runtime".into(),
            ..enabled()
        });
        assert!(!sb.is_available().await);
    }

    #[test]
    fn degradation_logged_once() {
        let sb = Sandbox::new(enabled());
        assert!(!sb.has_logged_degradation());
        sb.note_degraded();
        sb.note_degraded();
        assert!(sb.has_logged_degradation());
    }

    #[test]
    fn mount_mode_from_toml() {
        let cfg: SandboxConfig = toml::from_str("enabled = true\nworkspace_mount = \"read-write\"").unwrap();
        assert_eq!(cfg.workspace_mount, MountMode::ReadWrite);
        assert_eq!(cfg.image, "debian:stable-slim");
    }
}
