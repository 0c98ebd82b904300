use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxConfig;
use crate::timeout::ToolTimeouts;
use crate::truncate::OutputLimits;

fn default_true() -> bool {
    true
}

fn default_exec_max_secs() -> u64 {
    120
}

/// Top-level configuration for tool execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub timeouts: ToolTimeouts,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub output: OutputLimits,
}

/// Shell tool settings: extra deny patterns and the hard ceiling on run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default = "default_exec_max_secs")]
    pub max_timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deny_patterns: Vec::new(),
            max_timeout_secs: default_exec_max_secs(),
        }
    }
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

/// Configuration for the `web_fetch` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_fetch_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MountMode;

    #[test]
    fn deserialize_omitted_fields_use_defaults() {
        let config: ToolsConfig = toml::from_str("").unwrap();
        assert_eq!(config, ToolsConfig::default());
        assert!(config.shell.enabled);
        assert_eq!(config.shell.max_timeout_secs, 120);
        assert_eq!(config.fetch.timeout_secs, 15);
        assert_eq!(config.fetch.max_body_bytes, 1_048_576);
        assert!(!config.sandbox.enabled);
        assert_eq!(config.timeouts.effective("exec"), None);
    }

    #[test]
    fn deserialize_full_config() {
        let toml_str = r#"
            [shell]
            deny_patterns = ["git push*", "npm publish*"]
            max_timeout_secs = 30

            [sandbox]
            enabled = true
            image = "alpine:3"
            memory = "256m"
            workspace_mount = "read-write"

            [timeouts]
            default_ms = 5000
            [timeouts.overrides]
            web_fetch = 20000

            [fetch]
            max_body_bytes = 2097152

            [output]
            default_limit = 10000
            [output.per_tool]
            exec = 4000
        "#;

        let config: ToolsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.shell.deny_patterns.len(), 2);
        assert_eq!(config.shell.max_timeout_secs, 30);
        assert_eq!(config.sandbox.image, "alpine:3");
        assert_eq!(config.sandbox.workspace_mount, MountMode::ReadWrite);
        assert_eq!(config.timeouts.default_ms, 5000);
        assert_eq!(
            config.timeouts.effective("web_fetch"),
            Some(std::time::Duration::from_secs(20))
        );
        assert_eq!(config.fetch.max_body_bytes, 2_097_152);
        assert_eq!(config.output.storage_limit_for("exec"), 4000);
        assert_eq!(config.output.storage_limit_for("read"), 10000);
    }

    #[test]
    fn disabled_shell() {
        let config: ToolsConfig = toml::from_str("[shell]\nenabled = false\n").unwrap();
        assert!(!config.shell.enabled);
        assert!(config.shell.deny_patterns.is_empty());
    }
}
