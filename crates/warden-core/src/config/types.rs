use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use warden_tools::ToolsConfig;

use crate::cost::ModelPricing;

fn default_operator_id() -> String {
    "operator".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Identity of the human operator; messages addressed here skip simulation.
    #[serde(default = "default_operator_id")]
    pub operator_id: String,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub agent_bus: AgentBusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator_id: default_operator_id(),
            agents: default_agents(),
            providers: Vec::new(),
            tools: ToolsConfig::default(),
            pipeline: PipelineConfig::default(),
            guard: GuardConfig::default(),
            store: StoreConfig::default(),
            audit: AuditConfig::default(),
            cost: CostConfig::default(),
            retention: RetentionConfig::default(),
            agent_bus: AgentBusConfig::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}

fn default_agents() -> Vec<AgentConfig> {
    vec![AgentConfig::new("main", "gpt-4o-mini")]
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_bootstrap_files() -> Vec<String> {
    vec!["AGENTS.md".into()]
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentConfig {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Files under `workspace` folded into the system prompt when present.
    #[serde(default = "default_bootstrap_files")]
    pub bootstrap_files: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl AgentConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            fallback_models: Vec::new(),
            workspace: default_workspace(),
            extra_roots: Vec::new(),
            system_prompt: None,
            bootstrap_files: default_bootstrap_files(),
            max_tokens: default_max_tokens(),
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    #[must_use]
    pub fn with_fallbacks(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

macro_rules! bounded {
    ($name:ident, $ty:ty, $default:expr, $min:expr, $max:expr) => {
        pub(crate) mod $name {
            pub const DEFAULT: $ty = $default;
            pub const MIN: $ty = $min;
            pub const MAX: $ty = $max;
        }
    };
}

pub(crate) mod bounds {
    bounded!(recall_limit, usize, 50, 1, 500);
    bounded!(recall_token_cap, usize, 8_000, 256, 200_000);
    bounded!(recall_min_score, f32, 0.3, 0.0, 1.0);
    bounded!(sufficiency_threshold, f32, 0.7, 0.0, 1.0);
    bounded!(sufficiency_min_hits, usize, 3, 1, 20);
    bounded!(tool_context_expiry_turns, usize, 5, 1, 100);
    bounded!(notes_token_cap, usize, 1_000, 0, 20_000);
    bounded!(max_tool_rounds, usize, 10, 1, 50);
}

fn default_recall_limit() -> usize {
    bounds::recall_limit::DEFAULT
}
fn default_recall_token_cap() -> usize {
    bounds::recall_token_cap::DEFAULT
}
fn default_recall_min_score() -> f32 {
    bounds::recall_min_score::DEFAULT
}
fn default_sufficiency_threshold() -> f32 {
    bounds::sufficiency_threshold::DEFAULT
}
fn default_sufficiency_min_hits() -> usize {
    bounds::sufficiency_min_hits::DEFAULT
}
fn default_tool_context_expiry_turns() -> usize {
    bounds::tool_context_expiry_turns::DEFAULT
}
fn default_notes_token_cap() -> usize {
    bounds::notes_token_cap::DEFAULT
}
fn default_max_tool_rounds() -> usize {
    bounds::max_tool_rounds::DEFAULT
}

/// Per-turn recall and budget knobs. Every field is clamped by [`PipelineConfig::clamped`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum history rows pulled into a turn.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    /// Token budget for retrieved history before distillation kicks in.
    #[serde(default = "default_recall_token_cap")]
    pub recall_token_cap: usize,
    /// Notes scoring below this are never recalled.
    #[serde(default = "default_recall_min_score")]
    pub recall_min_score: f32,
    /// Score at which a recalled note counts toward sufficiency.
    #[serde(default = "default_sufficiency_threshold")]
    pub sufficiency_threshold: f32,
    /// Stop recalling once this many sufficient notes were found.
    #[serde(default = "default_sufficiency_min_hits")]
    pub sufficiency_min_hits: usize,
    /// Tool results older than this many user turns are elided from context.
    #[serde(default = "default_tool_context_expiry_turns")]
    pub tool_context_expiry_turns: usize,
    #[serde(default = "default_notes_token_cap")]
    pub notes_token_cap: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recall_limit: default_recall_limit(),
            recall_token_cap: default_recall_token_cap(),
            recall_min_score: default_recall_min_score(),
            sufficiency_threshold: default_sufficiency_threshold(),
            sufficiency_min_hits: default_sufficiency_min_hits(),
            tool_context_expiry_turns: default_tool_context_expiry_turns(),
            notes_token_cap: default_notes_token_cap(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl PipelineConfig {
    /// Pull every knob into its documented range. NaN scores fall back to the default.
    #[must_use]
    pub fn clamped(self) -> Self {
        fn score(v: f32, default: f32, min: f32, max: f32) -> f32 {
            if v.is_nan() { default } else { v.clamp(min, max) }
        }
        use bounds::*;
        Self {
            recall_limit: self
                .recall_limit
                .clamp(recall_limit::MIN, recall_limit::MAX),
            recall_token_cap: self
                .recall_token_cap
                .clamp(recall_token_cap::MIN, recall_token_cap::MAX),
            recall_min_score: score(
                self.recall_min_score,
                recall_min_score::DEFAULT,
                recall_min_score::MIN,
                recall_min_score::MAX,
            ),
            sufficiency_threshold: score(
                self.sufficiency_threshold,
                sufficiency_threshold::DEFAULT,
                sufficiency_threshold::MIN,
                sufficiency_threshold::MAX,
            ),
            sufficiency_min_hits: self
                .sufficiency_min_hits
                .clamp(sufficiency_min_hits::MIN, sufficiency_min_hits::MAX),
            tool_context_expiry_turns: self
                .tool_context_expiry_turns
                .clamp(tool_context_expiry_turns::MIN, tool_context_expiry_turns::MAX),
            notes_token_cap: self
                .notes_token_cap
                .clamp(notes_token_cap::MIN, notes_token_cap::MAX),
            max_tool_rounds: self
                .max_tool_rounds
                .clamp(max_tool_rounds::MIN, max_tool_rounds::MAX),
        }
    }
}

fn default_max_input_chars() -> usize {
    100_000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuardConfig {
    /// Additional case-insensitive regexes that trigger a refusal.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            extra_patterns: Vec::new(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_sqlite_path() -> String {
    "warden.db".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CostConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides and additions to the built-in price table, keyed by model.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pricing: HashMap::new(),
        }
    }
}

fn default_session_idle_days() -> u32 {
    30
}

fn default_message_days() -> u32 {
    90
}

fn default_mailbox_days() -> u32 {
    7
}

fn default_turn_days() -> u32 {
    90
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_session_idle_days")]
    pub session_idle_days: u32,
    #[serde(default = "default_message_days")]
    pub message_days: u32,
    #[serde(default = "default_mailbox_days")]
    pub mailbox_days: u32,
    #[serde(default = "default_turn_days")]
    pub turn_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_idle_days: default_session_idle_days(),
            message_days: default_message_days(),
            mailbox_days: default_mailbox_days(),
            turn_days: default_turn_days(),
        }
    }
}

fn default_ask_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AgentBusConfig {
    #[serde(default = "default_ask_timeout_secs")]
    pub ask_timeout_secs: u64,
}

impl Default for AgentBusConfig {
    fn default() -> Self {
        Self {
            ask_timeout_secs: default_ask_timeout_secs(),
        }
    }
}
