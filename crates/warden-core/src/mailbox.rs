//! Cross-agent messaging: fire-and-forget `send` and synchronous `ask`.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use warden_store::{AgentMessageRow, SqliteStore};
use warden_tools::executor::deserialize_params;
use warden_tools::{BoxFuture, ParallelPolicy, Tool, ToolContext, ToolDef, ToolError};

use crate::error::PipelineError;
use crate::pipeline::{InboundMessage, SenderKind, TurnOutcome};

const RESPONSE_PREVIEW_CHARS: usize = 200;

/// Runs a turn on behalf of the bus. Implemented by `TurnPipeline`.
pub trait TurnDispatcher: Send + Sync {
    fn knows_agent(&self, agent_id: &str) -> bool;

    fn dispatch_turn(
        &self,
        message: InboundMessage,
    ) -> BoxFuture<'_, Result<TurnOutcome, PipelineError>>;
}

/// Render pending mail for the recipient's next turn, one entry per message.
#[must_use]
pub fn format_pending(rows: &[AgentMessageRow]) -> String {
    rows.iter()
        .map(|row| {
            let mut line = format!("[From {}, {}] {}", row.from_agent, row.kind, row.content);
            if let Some(response) = &row.response {
                let preview: String = response.chars().take(RESPONSE_PREVIEW_CHARS).collect();
                let ellipsis = if response.chars().count() > RESPONSE_PREVIEW_CHARS {
                    "..."
                } else {
                    ""
                };
                let _ = write!(line, "\n  (your reply: {preview}{ellipsis})");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct AgentBus {
    store: SqliteStore,
    ask_timeout: Duration,
    dispatcher: OnceLock<Weak<dyn TurnDispatcher>>,
}

impl std::fmt::Debug for AgentBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBus")
            .field("ask_timeout", &self.ask_timeout)
            .field("attached", &self.dispatcher.get().is_some())
            .finish_non_exhaustive()
    }
}

impl AgentBus {
    #[must_use]
    pub fn new(store: SqliteStore, ask_timeout: Duration) -> Self {
        Self {
            store,
            ask_timeout,
            dispatcher: OnceLock::new(),
        }
    }

    /// Wire the bus to the pipeline that owns it. Only the first call wins.
    pub fn attach(&self, dispatcher: Weak<dyn TurnDispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            tracing::warn!("agent bus already attached, ignoring");
        }
    }

    fn dispatcher(&self) -> Result<Arc<dyn TurnDispatcher>, PipelineError> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .ok_or(PipelineError::DispatcherUnavailable)
    }

    fn check_target(&self, from: &str, to: &str) -> Result<Arc<dyn TurnDispatcher>, PipelineError> {
        if from == to {
            return Err(PipelineError::SelfAddressed {
                agent_id: from.to_owned(),
            });
        }
        let dispatcher = self.dispatcher()?;
        if !dispatcher.knows_agent(to) {
            return Err(PipelineError::UnknownAgent {
                agent_id: to.to_owned(),
            });
        }
        Ok(dispatcher)
    }

    /// Queue `content` for `to`; it is surfaced at the start of their next turn.
    ///
    /// # Errors
    ///
    /// Returns an error for self-addressed or unknown targets, or if the
    /// insert fails.
    pub async fn send(&self, from: &str, to: &str, content: &str) -> Result<i64, PipelineError> {
        self.check_target(from, to)?;
        let id = self
            .store
            .enqueue_agent_message(from, to, "message", content)
            .await?;
        tracing::info!(from, to, id, "agent message queued");
        Ok(id)
    }

    /// Run a turn on `to` and wait for its reply, bounded by the ask timeout.
    ///
    /// The turn runs in session `agent:<from>` of the target. On timeout the
    /// turn is left running and its result is discarded. A completed exchange
    /// is recorded in the target's mailbox so its main session sees it.
    ///
    /// # Errors
    ///
    /// Returns `SelfAddressed` before dispatching when `from == to`,
    /// `AskTimeout` when the reply is late, or the target turn's own error.
    pub async fn ask(&self, from: &str, to: &str, question: &str) -> Result<String, PipelineError> {
        let dispatcher = self.check_target(from, to)?;
        let message = InboundMessage::new(to, format!("agent:{from}"), question)
            .with_channel("agent")
            .with_sender(SenderKind::Agent, from);

        let handle = tokio::spawn(async move { dispatcher.dispatch_turn(message).await });
        let outcome = match tokio::time::timeout(self.ask_timeout, handle).await {
            Err(_) => {
                let timeout_ms = u64::try_from(self.ask_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(from, to, timeout_ms, "ask timed out, abandoning reply");
                return Err(PipelineError::AskTimeout {
                    to: to.to_owned(),
                    timeout_ms,
                });
            }
            Ok(Err(join)) => return Err(PipelineError::Other(format!("ask task failed: {join}"))),
            Ok(Ok(result)) => result?,
        };

        let id = self
            .store
            .enqueue_agent_message(from, to, "ask", question)
            .await?;
        self.store.set_agent_response(id, &outcome.response).await?;
        tracing::info!(from, to, id, "ask answered");
        Ok(outcome.response)
    }
}

fn bus_error(tool: &str, error: PipelineError) -> ToolError {
    match error {
        PipelineError::AskTimeout { timeout_ms, .. } => ToolError::Timeout {
            tool: tool.to_owned(),
            timeout_ms,
        },
        PipelineError::SelfAddressed { .. } | PipelineError::UnknownAgent { .. } => {
            ToolError::Denied {
                tool: tool.to_owned(),
                reason: error.to_string(),
            }
        }
        other => ToolError::other(other.to_string()),
    }
}

#[derive(Deserialize, JsonSchema)]
struct SendParams {
    /// Recipient agent id
    to: String,
    /// Message body
    content: String,
}

pub struct SendMessageTool {
    bus: Arc<AgentBus>,
}

impl SendMessageTool {
    #[must_use]
    pub fn new(bus: Arc<AgentBus>) -> Self {
        Self { bus }
    }
}

impl Tool for SendMessageTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<SendParams>(
            "send_message",
            "Queue a message for another agent. It is shown at the start of their next turn.",
            ParallelPolicy::NEVER,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move {
            let params: SendParams = deserialize_params(input)?;
            let id = self
                .bus
                .send(&ctx.agent_id, &params.to, &params.content)
                .await
                .map_err(|e| bus_error("send_message", e))?;
            Ok(format!("message {id} queued for {}", params.to))
        })
    }
}

#[derive(Deserialize, JsonSchema)]
struct AskParams {
    /// Agent id to ask
    to: String,
    /// Question to answer
    question: String,
}

pub struct AskAgentTool {
    bus: Arc<AgentBus>,
}

impl AskAgentTool {
    #[must_use]
    pub fn new(bus: Arc<AgentBus>) -> Self {
        Self { bus }
    }
}

impl Tool for AskAgentTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<AskParams>(
            "ask_agent",
            "Ask another agent a question and wait for its answer.",
            ParallelPolicy::NEVER,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move {
            let params: AskParams = deserialize_params(input)?;
            self.bus
                .ask(&ctx.agent_id, &params.to, &params.question)
                .await
                .map_err(|e| bus_error("ask_agent", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Echo {
        agents: Vec<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                agents: vec!["ops", "research"],
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl TurnDispatcher for Echo {
        fn knows_agent(&self, agent_id: &str) -> bool {
            self.agents.iter().any(|a| *a == agent_id)
        }

        fn dispatch_turn(
            &self,
            message: InboundMessage,
        ) -> BoxFuture<'_, Result<TurnOutcome, PipelineError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                Ok(TurnOutcome {
                    response: format!("{} says: {}", message.agent_id, message.text),
                    session_id: format!("{}:{}", message.agent_id, message.session_key),
                    ..TurnOutcome::default()
                })
            })
        }
    }

    async fn bus_with(echo: &Arc<Echo>, timeout: Duration) -> Arc<AgentBus> {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let bus = Arc::new(AgentBus::new(store, timeout));
        let dispatcher: Arc<dyn TurnDispatcher> = echo.clone();
        bus.attach(Arc::downgrade(&dispatcher));
        bus
    }

    #[tokio::test]
    async fn send_queues_for_known_agent() {
        let echo = Echo::new(Duration::ZERO);
        let bus = bus_with(&echo, Duration::from_secs(1)).await;
        bus.send("ops", "research", "check the logs").await.unwrap();

        let pending = bus.store.pending_agent_messages("research").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(format_pending(&pending), "[From ops, message] check the logs");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_agent_fails() {
        let echo = Echo::new(Duration::ZERO);
        let bus = bus_with(&echo, Duration::from_secs(1)).await;
        let err = bus.send("ops", "ghost", "hi").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn ask_returns_reply_and_records_exchange() {
        let echo = Echo::new(Duration::ZERO);
        let bus = bus_with(&echo, Duration::from_secs(1)).await;
        let reply = bus.ask("ops", "research", "what changed?").await.unwrap();
        assert_eq!(reply, "research says: what changed?");

        let pending = bus.store.pending_agent_messages("research").await.unwrap();
        assert_eq!(pending[0].kind, "ask");
        assert_eq!(pending[0].response.as_deref(), Some(reply.as_str()));
    }

    #[tokio::test]
    async fn self_ask_is_rejected_before_dispatch() {
        let echo = Echo::new(Duration::ZERO);
        let bus = bus_with(&echo, Duration::from_secs(1)).await;
        let err = bus.ask("ops", "ops", "loop?").await.unwrap_err();
        assert!(matches!(err, PipelineError::SelfAddressed { .. }));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_ask_times_out_and_leaves_no_record() {
        let echo = Echo::new(Duration::from_secs(5));
        let bus = bus_with(&echo, Duration::from_millis(50)).await;
        let err = bus.ask("ops", "research", "slow?").await.unwrap_err();
        assert!(matches!(err, PipelineError::AskTimeout { timeout_ms: 50, .. }));
        assert!(bus.store.pending_agent_messages("research").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detached_bus_reports_unavailable() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let bus = AgentBus::new(store, Duration::from_secs(1));
        let err = bus.send("ops", "research", "hi").await.unwrap_err();
        assert!(matches!(err, PipelineError::DispatcherUnavailable));
    }

    #[test]
    fn pending_responses_are_truncated() {
        let rows = vec![AgentMessageRow {
            id: 1,
            from_agent: "ops".into(),
            to_agent: "research".into(),
            kind: "ask".into(),
            content: "status?".into(),
            response: Some("y".repeat(300)),
        }];
        let text = format_pending(&rows);
        assert!(text.starts_with("[From ops, ask] status?\n  (your reply: "));
        assert!(text.ends_with("...)"));
        assert!(text.contains(&"y".repeat(RESPONSE_PREVIEW_CHARS)));
        assert!(!text.contains(&"y".repeat(RESPONSE_PREVIEW_CHARS + 1)));
    }

    #[tokio::test]
    async fn tools_map_bus_errors() {
        let echo = Echo::new(Duration::ZERO);
        let bus = bus_with(&echo, Duration::from_secs(1)).await;
        let ctx = ToolContext::new("ops", "ops:main", ".");

        let ask = AskAgentTool::new(Arc::clone(&bus));
        let err = ask
            .execute(&json!({"to": "ops", "question": "me?"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Denied { .. }));

        let send = SendMessageTool::new(bus);
        let out = send
            .execute(&json!({"to": "research", "content": "fyi"}), &ctx)
            .await
            .unwrap();
        assert!(out.contains("queued for research"));
        assert_eq!(send.definition().name, "send_message");
    }
}
