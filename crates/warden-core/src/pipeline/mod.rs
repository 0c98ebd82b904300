//! The per-turn state machine: resolve, guard, context, history, execute, finalize.

mod execute;
mod locks;
mod simulate;
mod stages;
mod state;

pub use locks::SessionLocks;
pub use simulate::RouterSimulator;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use warden_llm::{ProviderRouter, Usage};
use warden_store::SqliteStore;
use warden_tools::{AuditChain, BoxFuture, Simulator, ToolRegistry};

use crate::background::RetryPolicy;
use crate::config::{Config, PipelineConfig, PipelineConfigCache};
use crate::cost::CostTracker;
use crate::error::PipelineError;
use crate::events::{self, EventSink, TurnEvent, TurnEventStream};
use crate::guard::{GuardVerdict, InputGuard};
use crate::hooks::{HookEvent, PluginHookBus};
use crate::mailbox::TurnDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderKind {
    #[default]
    User,
    Agent,
    System,
}

impl SenderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: String,
    pub agent_id: String,
    pub session_key: String,
    pub channel: String,
    pub sender_kind: SenderKind,
    pub sender_id: String,
    pub media: Vec<String>,
}

impl InboundMessage {
    /// A user message on the `cli` channel from the operator.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        session_key: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            agent_id: agent_id.into(),
            session_key: session_key.into(),
            channel: "cli".into(),
            sender_kind: SenderKind::User,
            sender_id: "operator".into(),
            media: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    #[must_use]
    pub fn with_sender(mut self, kind: SenderKind, id: impl Into<String>) -> Self {
        self.sender_kind = kind;
        self.sender_id = id.into();
        self
    }

    #[must_use]
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }
}

/// Result of one turn. Refusals carry zero tool calls and zero usage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnOutcome {
    pub response: String,
    pub session_id: String,
    pub tool_calls: u32,
    pub usage: Usage,
    pub refused: bool,
    /// The turn stopped early (cancelled, or failed after tools already ran).
    pub partial: bool,
    pub loop_cap_reached: bool,
    pub cost_usd: f64,
}

pub struct TurnPipeline {
    config: RwLock<Arc<Config>>,
    config_source: Option<(PathBuf, Arc<PipelineConfigCache>)>,
    store: SqliteStore,
    router: Arc<ProviderRouter>,
    registry: Arc<ToolRegistry>,
    hooks: Arc<PluginHookBus>,
    guard: RwLock<Arc<InputGuard>>,
    audit: Option<Arc<AuditChain>>,
    cost: CostTracker,
    simulator: Option<Arc<dyn Simulator>>,
    locks: SessionLocks,
    flush_policy: RetryPolicy,
}

impl std::fmt::Debug for TurnPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPipeline")
            .field("tools", &self.registry.names())
            .field("audit", &self.audit.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl TurnPipeline {
    /// Audit write-through is on when `config.audit.enabled`, backed by `store`.
    #[must_use]
    pub fn new(
        config: Config,
        store: SqliteStore,
        router: Arc<ProviderRouter>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let audit = config
            .audit
            .enabled
            .then(|| Arc::new(AuditChain::new(Arc::new(store.clone()))));
        Self {
            guard: RwLock::new(Arc::new(InputGuard::new(&config.guard))),
            hooks: Arc::new(PluginHookBus::new(Arc::clone(&config))),
            cost: CostTracker::new(&config.cost),
            config: RwLock::new(config),
            config_source: None,
            store,
            router,
            registry,
            audit,
            simulator: None,
            locks: SessionLocks::new(),
            flush_policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<PluginHookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Override the reviewer used for simulation; defaults to the agent's model.
    #[must_use]
    pub fn with_simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Option<Arc<AuditChain>>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_cost_tracker(mut self, cost: CostTracker) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_flush_policy(mut self, policy: RetryPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    /// Read pipeline knobs from `path` on every turn through `cache`, so edits
    /// apply without a full reload.
    #[must_use]
    pub fn with_config_source(mut self, path: impl Into<PathBuf>, cache: Arc<PipelineConfigCache>) -> Self {
        self.config_source = Some((path.into(), cache));
        self
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<PluginHookBus> {
        &self.hooks
    }

    #[must_use]
    pub fn cost(&self) -> &CostTracker {
        &self.cost
    }

    #[must_use]
    pub fn audit(&self) -> Option<&Arc<AuditChain>> {
        self.audit.as_ref()
    }

    fn guard(&self) -> Arc<InputGuard> {
        Arc::clone(&self.guard.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn pipeline_config(&self, config: &Config) -> Arc<PipelineConfig> {
        let Some((path, cache)) = &self.config_source else {
            return Arc::new(config.pipeline.clone());
        };
        cache.get(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "pipeline config unreadable, using loaded values");
            Arc::new(config.pipeline.clone())
        })
    }

    /// Swap in a new configuration, rebuild the input guard and notify plugins.
    pub async fn reload(&self, config: Config) {
        let config = Arc::new(config);
        *self.guard.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(InputGuard::new(&config.guard));
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&config);
        if let Some((_, cache)) = &self.config_source {
            cache.invalidate();
        }
        self.hooks.set_config(config);
        let report = self.hooks.dispatch(&HookEvent::ConfigReload).await;
        tracing::info!(plugins_failed = report.failed.len(), "configuration reloaded");
    }

    /// Run a turn to completion and return only its outcome.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownAgent` when the target agent is not
    /// configured, or a provider/store error when the turn fails before any
    /// tool ran.
    pub async fn run_buffered(&self, message: InboundMessage) -> Result<TurnOutcome, PipelineError> {
        self.run_turn(message, None, &CancellationToken::new()).await
    }

    /// Run a turn in the background and stream its events.
    ///
    /// The stream ends with exactly one `TurnComplete` or `Failed`. Cancelling
    /// `cancel` stops further model rounds; tools already running finish and the
    /// turn finalizes as partial.
    pub fn run_streaming(
        self: &Arc<Self>,
        message: InboundMessage,
        cancel: CancellationToken,
    ) -> TurnEventStream {
        let (sink, stream) = EventSink::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run_turn(message, Some(&sink), &cancel).await {
                Ok(outcome) => sink.emit(TurnEvent::TurnComplete(outcome)).await,
                Err(e) => {
                    tracing::warn!(error = %e, "streaming turn failed");
                    sink.emit(TurnEvent::Failed(e.to_string())).await;
                }
            }
        });
        stream
    }

    async fn run_turn(
        &self,
        message: InboundMessage,
        sink: Option<&EventSink>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, PipelineError> {
        let config = self.config();
        let pipeline = self.pipeline_config(&config);

        let mut state = stages::resolve(&config, message)?;
        let _session = self.locks.acquire(&state.session_id).await;
        tracing::debug!(agent = %state.agent.id, session = %state.session_id, "turn started");
        events::emit(
            sink,
            TurnEvent::Start {
                agent_id: state.agent.id.clone(),
                session_id: state.session_id.clone(),
            },
        )
        .await;

        if let GuardVerdict::Refuse { reason } = self.guard().check(&state.inbound.text) {
            self.refuse(&mut state, &reason, sink).await?;
            return self.finalize(state).await;
        }

        self.build_context(&pipeline, &mut state).await;
        self.build_history(&pipeline, &mut state).await?;
        self.execute(&config, &pipeline, &mut state, sink, cancel).await?;
        self.finalize(state).await
    }
}

impl TurnDispatcher for TurnPipeline {
    fn knows_agent(&self, agent_id: &str) -> bool {
        self.config().agent(agent_id).is_some()
    }

    fn dispatch_turn(
        &self,
        message: InboundMessage,
    ) -> BoxFuture<'_, Result<TurnOutcome, PipelineError>> {
        Box::pin(self.run_buffered(message))
    }
}
