//! Lifecycle notifications delivered to registered plugins.
//!
//! Every hook is a variant of [`HookEvent`] with its own payload, and dispatch
//! is an exhaustive match onto the matching [`Plugin`] method. A plugin that
//! errors or panics is logged and skipped; the remaining plugins still run.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use warden_tools::BoxFuture;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnStartInfo {
    pub agent_id: String,
    pub session_id: String,
    pub seq: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEndInfo {
    pub agent_id: String,
    pub session_id: String,
    pub response: String,
    pub tool_calls: u32,
    pub refused: bool,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistillStartInfo {
    pub session_id: String,
    pub messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistillEndInfo {
    pub session_id: String,
    pub summarized: usize,
    /// `false` when summarization failed and history was truncated instead.
    pub summarized_by_model: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Start,
    Shutdown,
    BeforeTurn(TurnStartInfo),
    AfterTurn(TurnEndInfo),
    BeforeDistill(DistillStartInfo),
    AfterDistill(DistillEndInfo),
    ConfigReload,
}

impl HookEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Shutdown => "shutdown",
            Self::BeforeTurn(_) => "before-turn",
            Self::AfterTurn(_) => "after-turn",
            Self::BeforeDistill(_) => "before-distill",
            Self::AfterDistill(_) => "after-distill",
            Self::ConfigReload => "config-reload",
        }
    }
}

/// Handle given to plugins: leveled logging tagged with the plugin name and a
/// read-only view of the current configuration.
#[derive(Debug, Clone)]
pub struct PluginApi {
    plugin: String,
    config: Arc<Config>,
}

impl PluginApi {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin = %self.plugin, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin = %self.plugin, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin = %self.plugin, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin = %self.plugin, "{message}");
    }
}

type HookResult<'a> = BoxFuture<'a, Result<(), HookError>>;

fn noop<'a>() -> HookResult<'a> {
    Box::pin(async { Ok(()) })
}

/// Lifecycle observer. Every hook defaults to a no-op.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_start<'a>(&'a self, _api: &'a PluginApi) -> HookResult<'a> {
        noop()
    }

    fn on_shutdown<'a>(&'a self, _api: &'a PluginApi) -> HookResult<'a> {
        noop()
    }

    fn on_before_turn<'a>(&'a self, _api: &'a PluginApi, _info: &'a TurnStartInfo) -> HookResult<'a> {
        noop()
    }

    fn on_after_turn<'a>(&'a self, _api: &'a PluginApi, _info: &'a TurnEndInfo) -> HookResult<'a> {
        noop()
    }

    fn on_before_distill<'a>(
        &'a self,
        _api: &'a PluginApi,
        _info: &'a DistillStartInfo,
    ) -> HookResult<'a> {
        noop()
    }

    fn on_after_distill<'a>(
        &'a self,
        _api: &'a PluginApi,
        _info: &'a DistillEndInfo,
    ) -> HookResult<'a> {
        noop()
    }

    fn on_config_reload<'a>(&'a self, _api: &'a PluginApi) -> HookResult<'a> {
        noop()
    }
}

/// Outcome of one dispatch: how many plugins ran cleanly and which failed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

pub struct PluginHookBus {
    plugins: Vec<Arc<dyn Plugin>>,
    config: RwLock<Arc<Config>>,
}

impl std::fmt::Debug for PluginHookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHookBus")
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

impl PluginHookBus {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            plugins: Vec::new(),
            config: RwLock::new(config),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        tracing::debug!(plugin = %plugin.name(), "plugin registered");
        self.plugins.push(plugin);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Swap the config view handed to plugins; call before dispatching `ConfigReload`.
    pub fn set_config(&self, config: Arc<Config>) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Deliver `event` to every plugin in registration order.
    pub async fn dispatch(&self, event: &HookEvent) -> DispatchReport {
        let config = Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner));
        let mut report = DispatchReport::default();

        for plugin in &self.plugins {
            let api = PluginApi {
                plugin: plugin.name().to_owned(),
                config: Arc::clone(&config),
            };
            let fut = match event {
                HookEvent::Start => plugin.on_start(&api),
                HookEvent::Shutdown => plugin.on_shutdown(&api),
                HookEvent::BeforeTurn(info) => plugin.on_before_turn(&api, info),
                HookEvent::AfterTurn(info) => plugin.on_after_turn(&api, info),
                HookEvent::BeforeDistill(info) => plugin.on_before_distill(&api, info),
                HookEvent::AfterDistill(info) => plugin.on_after_distill(&api, info),
                HookEvent::ConfigReload => plugin.on_config_reload(&api),
            };
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(e)) => {
                    tracing::warn!(plugin = %plugin.name(), hook = event.name(), error = %e, "plugin hook failed");
                    report.failed.push(plugin.name().to_owned());
                }
                Err(_) => {
                    tracing::error!(plugin = %plugin.name(), hook = event.name(), "plugin hook panicked");
                    report.failed.push(plugin.name().to_owned());
                }
            }
        }
        report
    }
}
