use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use warden_llm::{ChatResponse, CompletionRequest, Message, MessagePart, Role, ToolUseRequest};
use warden_tools::reversibility::{classify, simulation_prompt, simulation_requirement};
use warden_tools::{
    AuditRecord, Reversibility, SimulationVerdict, Simulator, ToolCall, ToolContext, ToolError,
    plan_batches, run_with_timeout, truncate_for_context, truncate_for_storage,
};

use super::simulate::RouterSimulator;
use super::state::TurnState;
use super::TurnPipeline;
use crate::config::{AgentConfig, Config, PipelineConfig};
use crate::error::PipelineError;
use crate::events::{self, EventSink, TurnEvent};

/// Identical consecutive tool rounds that end the turn.
const DOOM_LOOP_ROUNDS: usize = 3;
const AUDIT_TARGET_CHARS: usize = 200;
const AUDIT_TARGET_KEYS: &[&str] = &["command", "path", "url", "to"];

struct ToolRun {
    output: String,
    is_error: bool,
    audit: Option<AuditRecord>,
}

struct CallResult {
    call: ToolCall,
    output: String,
    is_error: bool,
}

fn tool_use_message(response: &ChatResponse) -> Message {
    let mut parts = Vec::with_capacity(response.tool_calls.len() + 1);
    if !response.text.is_empty() {
        parts.push(MessagePart::Text {
            text: response.text.clone(),
        });
    }
    parts.extend(response.tool_calls.iter().map(|c| MessagePart::ToolUse {
        id: c.id.clone(),
        name: c.name.clone(),
        input: c.input.clone(),
    }));
    Message {
        role: Role::Assistant,
        content: response.text.clone(),
        parts,
    }
}

/// Tool results as one user message. `shape` maps each stored output to what
/// the message carries.
fn tool_result_message(results: &[CallResult], shape: impl Fn(&str) -> String) -> Message {
    let content = results
        .iter()
        .map(|r| format!("[{} {}]", r.call.name, if r.is_error { "failed" } else { "ok" }))
        .collect::<Vec<_>>()
        .join("\n");
    let parts = results
        .iter()
        .map(|r| MessagePart::ToolResult {
            tool_use_id: r.call.id.clone(),
            content: shape(&r.output),
            is_error: r.is_error,
        })
        .collect();
    Message {
        role: Role::User,
        content,
        parts,
    }
}

fn round_signature(results: &[CallResult]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for r in results {
        r.call.name.hash(&mut hasher);
        r.call.input.to_string().hash(&mut hasher);
        r.output.hash(&mut hasher);
    }
    hasher.finish()
}

fn is_doom_loop(signatures: &[u64]) -> bool {
    signatures.len() >= DOOM_LOOP_ROUNDS
        && signatures[signatures.len() - DOOM_LOOP_ROUNDS..]
            .windows(2)
            .all(|w| w[0] == w[1])
}

fn audit_target(call: &ToolCall) -> Option<String> {
    AUDIT_TARGET_KEYS
        .iter()
        .find_map(|key| call.str_arg(key))
        .map(|v| v.chars().take(AUDIT_TARGET_CHARS).collect())
}

fn error_status(error: &ToolError) -> &'static str {
    match error {
        ToolError::Timeout { .. } => "timeout",
        ToolError::Denied { .. } => "denied",
        ToolError::Blocked { .. }
        | ToolError::PathOutsideWorkspace { .. }
        | ToolError::NetworkBlocked { .. } => "blocked",
        ToolError::InvalidParams { .. }
        | ToolError::UnknownTool { .. }
        | ToolError::Execution(_) => "error",
    }
}

fn tool_context(agent: &AgentConfig, session_id: &str) -> ToolContext {
    ToolContext::new(agent.id.clone(), session_id, agent.workspace.clone())
        .with_extra_roots(agent.extra_roots.clone())
}

impl TurnPipeline {
    fn simulator_for(&self, agent: &AgentConfig) -> Arc<dyn Simulator> {
        match &self.simulator {
            Some(simulator) => Arc::clone(simulator),
            None => Arc::new(RouterSimulator::new(
                Arc::clone(&self.router),
                agent.model.clone(),
                agent.fallback_models.clone(),
            )),
        }
    }

    /// Model-and-tools loop. A failure after any tool ran becomes a partial
    /// outcome so committed side effects are still reported.
    pub(super) async fn execute(
        &self,
        config: &Config,
        pipeline: &PipelineConfig,
        state: &mut TurnState,
        sink: Option<&EventSink>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        match self.execute_rounds(config, pipeline, state, sink, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if state.tool_calls > 0 => {
                tracing::warn!(
                    agent = %state.agent.id,
                    session = %state.session_id,
                    tool_calls = state.tool_calls,
                    error = %e,
                    "turn failed after tools ran, keeping partial outcome"
                );
                state.partial = true;
                if state.response.is_empty() {
                    state.response = format!(
                        "The turn stopped early after {} tool call(s): {e}",
                        state.tool_calls
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_rounds(
        &self,
        config: &Config,
        pipeline: &PipelineConfig,
        state: &mut TurnState,
        sink: Option<&EventSink>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let tools = self.registry.definitions();
        let simulator = self.simulator_for(&state.agent);
        let ctx = tool_context(&state.agent, &state.session_id);
        let mut signatures = Vec::new();

        for round in 0..pipeline.max_tool_rounds {
            if cancel.is_cancelled() {
                mark_cancelled(state);
                return Ok(());
            }

            let mut request = CompletionRequest::new(state.agent.model.clone(), state.messages.clone());
            request.system.clone_from(&state.system);
            request.tools.clone_from(&tools);
            request.max_tokens = state.agent.max_tokens;

            let span = tracing::info_span!("llm_call", model = %state.agent.model, round);
            let completion = self
                .router
                .complete_with_failover(&request, &state.agent.fallback_models)
                .instrument(span);
            let response = tokio::select! {
                result = completion => result?,
                () = cancel.cancelled() => {
                    mark_cancelled(state);
                    return Ok(());
                }
            };

            state.usage.accumulate(&response.usage);
            if !response.text.is_empty() {
                events::emit(sink, TurnEvent::TextDelta(response.text.clone())).await;
            }

            if !response.wants_tools() {
                let reply = Message::assistant(response.text.clone());
                self.store.append_message(&state.session_id, &reply).await?;
                state.messages.push(reply);
                state.response = response.text;
                return Ok(());
            }

            let assistant = tool_use_message(&response);
            self.store.append_message(&state.session_id, &assistant).await?;
            state.messages.push(assistant);
            if !response.text.is_empty() {
                state.response.clone_from(&response.text);
            }

            let results = self
                .run_tool_round(config, state, &ctx, simulator.as_ref(), response.tool_calls, sink)
                .await;
            let budget = config.tools.output.context_budget;
            let stored = tool_result_message(&results, str::to_owned);
            self.store.append_message(&state.session_id, &stored).await?;
            state
                .messages
                .push(tool_result_message(&results, |out| truncate_for_context(out, budget)));

            signatures.push(round_signature(&results));
            if is_doom_loop(&signatures) {
                tracing::warn!(
                    agent = %state.agent.id,
                    session = %state.session_id,
                    rounds = DOOM_LOOP_ROUNDS,
                    "identical tool rounds repeating, stopping turn"
                );
                state.loop_cap_reached = true;
                state.response = format!(
                    "Stopped: the last {DOOM_LOOP_ROUNDS} tool rounds produced identical results."
                );
                return Ok(());
            }
        }

        tracing::warn!(
            agent = %state.agent.id,
            session = %state.session_id,
            max_rounds = pipeline.max_tool_rounds,
            "tool loop cap reached"
        );
        state.loop_cap_reached = true;
        if state.response.is_empty() {
            state.response = format!(
                "Stopped after {} tool rounds without a final answer.",
                pipeline.max_tool_rounds
            );
        }
        Ok(())
    }

    /// Run one round's calls batch by batch; calls inside a batch run concurrently.
    async fn run_tool_round(
        &self,
        config: &Config,
        state: &mut TurnState,
        ctx: &ToolContext,
        simulator: &dyn Simulator,
        requests: Vec<ToolUseRequest>,
        sink: Option<&EventSink>,
    ) -> Vec<CallResult> {
        let calls: Vec<ToolCall> = requests
            .into_iter()
            .map(|r| ToolCall::new(r.id, r.name, r.input))
            .collect();
        let batches = plan_batches(calls, |name| self.registry.parallel_policy(name));
        tracing::debug!(batches = batches.len(), "planned tool batches");

        let mut results = Vec::new();
        for batch in batches {
            let runs = join_all(batch.iter().map(|call| {
                let span = tracing::info_span!("tool_exec", tool = %call.name, call_id = %call.id);
                self.run_tool_call(config, ctx, simulator, call).instrument(span)
            }))
            .await;

            for (call, run) in batch.into_iter().zip(runs) {
                state.tool_calls = state.tool_calls.saturating_add(1);
                if let Some(record) = run.audit {
                    state.audit.push(record);
                }
                events::emit(
                    sink,
                    TurnEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        is_error: run.is_error,
                        output: run.output.clone(),
                    },
                )
                .await;
                results.push(CallResult {
                    call,
                    output: run.output,
                    is_error: run.is_error,
                });
            }
        }
        results
    }

    async fn run_tool_call(
        &self,
        config: &Config,
        ctx: &ToolContext,
        simulator: &dyn Simulator,
        call: &ToolCall,
    ) -> ToolRun {
        let tag = classify(&call.name, &call.input);
        let (output, is_error, status) = match self.gated_call(config, ctx, simulator, call).await {
            Ok(out) => {
                let limit = config.tools.output.storage_limit_for(&call.name);
                (truncate_for_storage(&out, limit), false, "ok")
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                (format!("[error] {e}"), true, error_status(&e))
            }
        };

        let audit = (tag != Reversibility::Reversible).then(|| {
            let record = AuditRecord::new(ctx.agent_id.clone(), format!("tool.{}", call.name))
                .with_role("agent")
                .with_status(status);
            match audit_target(call) {
                Some(target) => record.with_target(target),
                None => record,
            }
        });
        ToolRun {
            output,
            is_error,
            audit,
        }
    }

    /// Simulation gate, then the timeout race around the tool itself.
    async fn gated_call(
        &self,
        config: &Config,
        ctx: &ToolContext,
        simulator: &dyn Simulator,
        call: &ToolCall,
    ) -> Result<String, ToolError> {
        if let Some(reason) = simulation_requirement(call, &config.operator_id) {
            let verdict = match simulator.simulate(&simulation_prompt(call, &reason)).await {
                Ok(reply) => SimulationVerdict::parse(&reply),
                Err(e) => SimulationVerdict {
                    proceed: false,
                    reasoning: format!("simulation unavailable: {e}"),
                },
            };
            if !verdict.proceed {
                tracing::info!(tool = %call.name, reason = %verdict.reasoning, "simulation denied tool call");
                return Err(ToolError::Denied {
                    tool: call.name.clone(),
                    reason: verdict.reasoning,
                });
            }
            tracing::debug!(tool = %call.name, "simulation approved tool call");
        }

        let timeout = config.tools.timeouts.effective(&call.name);
        run_with_timeout(&call.name, timeout, self.registry.dispatch(call, ctx)).await
    }
}

fn mark_cancelled(state: &mut TurnState) {
    tracing::info!(agent = %state.agent.id, session = %state.session_id, "turn cancelled");
    state.partial = true;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn result(name: &str, output: &str) -> CallResult {
        CallResult {
            call: ToolCall::new("c1", name, json!({"path": "a"})),
            output: output.to_owned(),
            is_error: false,
        }
    }

    #[test]
    fn doom_loop_needs_identical_consecutive_rounds() {
        assert!(!is_doom_loop(&[1, 1]));
        assert!(is_doom_loop(&[1, 1, 1]));
        assert!(!is_doom_loop(&[1, 1, 2]));
        assert!(is_doom_loop(&[2, 1, 1, 1]));
    }

    #[test]
    fn signature_changes_with_output() {
        let a = round_signature(&[result("read", "one")]);
        let b = round_signature(&[result("read", "two")]);
        assert_ne!(a, b);
        assert_eq!(a, round_signature(&[result("read", "one")]));
    }

    #[test]
    fn result_message_shapes_parts_only() {
        let msg = tool_result_message(&[result("read", "abcdef")], |s| s[..3].to_owned());
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "[read ok]");
        assert_eq!(
            msg.parts,
            vec![MessagePart::ToolResult {
                tool_use_id: "c1".into(),
                content: "abc".into(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn audit_target_prefers_command_then_path() {
        let call = ToolCall::new("c", "exec", json!({"command": "ls", "path": "x"}));
        assert_eq!(audit_target(&call).as_deref(), Some("ls"));
        let call = ToolCall::new("c", "write", json!({"path": "notes.md"}));
        assert_eq!(audit_target(&call).as_deref(), Some("notes.md"));
        assert!(audit_target(&ToolCall::new("c", "x", json!({}))).is_none());
    }
}
