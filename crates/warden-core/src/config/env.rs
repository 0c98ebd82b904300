use super::{Config, ConfigError};

fn parse_bool(var: &str, v: &str) -> Option<bool> {
    let parsed = v.parse::<bool>().ok();
    if parsed.is_none() {
        tracing::warn!("ignoring invalid {var} value: {v}");
    }
    parsed
}

fn parse_num<T: std::str::FromStr>(var: &str, v: &str) -> Option<T> {
    let parsed = v.trim().parse::<T>().ok();
    if parsed.is_none() {
        tracing::warn!("ignoring invalid {var} value: {v}");
    }
    parsed
}

impl Config {
    /// Apply `WARDEN_*` overrides. Malformed booleans and counts are ignored
    /// with a warning; a malformed timeout is an error.
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("WARDEN_OPERATOR_ID") {
            self.operator_id = v;
        }
        if let Ok(v) = std::env::var("WARDEN_SQLITE_PATH") {
            self.store.path = v;
        }
        if let Ok(v) = std::env::var("WARDEN_AUDIT_ENABLED")
            && let Some(enabled) = parse_bool("WARDEN_AUDIT_ENABLED", &v)
        {
            self.audit.enabled = enabled;
        }
        if let Ok(v) = std::env::var("WARDEN_SANDBOX_ENABLED")
            && let Some(enabled) = parse_bool("WARDEN_SANDBOX_ENABLED", &v)
        {
            self.tools.sandbox.enabled = enabled;
        }
        if let Ok(v) = std::env::var("WARDEN_SANDBOX_IMAGE") {
            self.tools.sandbox.image = v;
        }
        if let Ok(v) = std::env::var("WARDEN_SANDBOX_ALLOW_NETWORK")
            && let Some(allow) = parse_bool("WARDEN_SANDBOX_ALLOW_NETWORK", &v)
        {
            self.tools.sandbox.allow_network = allow;
        }
        if let Ok(v) = std::env::var("WARDEN_SHELL_DENY_PATTERNS") {
            self.tools.shell.deny_patterns.extend(
                v.split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty()),
            );
        }
        if let Ok(v) = std::env::var("WARDEN_TOOL_TIMEOUT_MS") {
            self.tools.timeouts.default_ms = warden_tools::timeout::parse_timeout_ms(&v)
                .map_err(|e| ConfigError::InvalidEnv {
                    var: "WARDEN_TOOL_TIMEOUT_MS",
                    message: e.to_string(),
                })?;
        }
        if let Ok(v) = std::env::var("WARDEN_PIPELINE_RECALL_LIMIT")
            && let Some(n) = parse_num("WARDEN_PIPELINE_RECALL_LIMIT", &v)
        {
            self.pipeline.recall_limit = n;
        }
        if let Ok(v) = std::env::var("WARDEN_PIPELINE_MAX_TOOL_ROUNDS")
            && let Some(n) = parse_num("WARDEN_PIPELINE_MAX_TOOL_ROUNDS", &v)
        {
            self.pipeline.max_tool_rounds = n;
        }
        if let Ok(v) = std::env::var("WARDEN_ASK_TIMEOUT_SECS")
            && let Some(n) = parse_num("WARDEN_ASK_TIMEOUT_SECS", &v)
        {
            self.agent_bus.ask_timeout_secs = n;
        }
        Ok(())
    }
}
