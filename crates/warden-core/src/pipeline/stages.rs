use std::collections::HashSet;
use std::path::Path;

use warden_llm::{Message, MessagePart, Role};
use warden_store::{HistoryRow, TurnRecord};
use warden_tools::{AuditRecord, safe_path};

use super::state::TurnState;
use super::{InboundMessage, TurnOutcome, TurnPipeline};
use crate::background::flush_notes;
use crate::config::{AgentConfig, Config, PipelineConfig};
use crate::distill;
use crate::error::PipelineError;
use crate::events::{self, EventSink, TurnEvent};
use crate::guard::REFUSAL_TEXT;
use crate::hooks::{DistillEndInfo, DistillStartInfo, HookEvent, TurnEndInfo, TurnStartInfo};
use crate::mailbox::format_pending;

const NOTES_SCAN_LIMIT: u32 = 200;
const NOTE_EXCERPT_CHARS: usize = 300;
pub(crate) const EXPIRED_TOOL_OUTPUT: &str = "[tool output expired]";

/// Look up the target agent. No side effects.
pub(super) fn resolve(config: &Config, inbound: InboundMessage) -> Result<TurnState, PipelineError> {
    let agent = config
        .agent(&inbound.agent_id)
        .cloned()
        .ok_or_else(|| PipelineError::UnknownAgent {
            agent_id: inbound.agent_id.clone(),
        })?;
    let session_id = warden_store::session_id(&agent.id, &inbound.session_key);
    Ok(TurnState::new(agent, session_id, inbound))
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Pick notes relevant to `query` by keyword overlap.
///
/// Notes below `recall_min_score` are skipped, recall stops once
/// `sufficiency_min_hits` notes reach `sufficiency_threshold`, and the total
/// never exceeds `notes_token_cap`.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn recall_notes(query: &str, notes: &[String], config: &PipelineConfig) -> Vec<String> {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(f32, &String)> = notes
        .iter()
        .map(|note| {
            let hits = terms(note).intersection(&query_terms).count();
            (hits as f32 / query_terms.len() as f32, note)
        })
        .filter(|(score, _)| *score > 0.0 && *score >= config.recall_min_score)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut recalled = Vec::new();
    let mut tokens = 0;
    let mut sufficient = 0;
    for (score, note) in scored {
        let cost = note.len() / 4;
        if tokens + cost > config.notes_token_cap {
            break;
        }
        tokens += cost;
        recalled.push(note.clone());
        if score >= config.sufficiency_threshold {
            sufficient += 1;
            if sufficient >= config.sufficiency_min_hits {
                break;
            }
        }
    }
    recalled
}

/// Elide tool results older than `expiry_turns` user turns.
pub(crate) fn expire_tool_results(messages: &mut [Message], expiry_turns: usize) {
    let mut age = 0;
    for message in messages.iter_mut().rev() {
        let has_results = message
            .parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolResult { .. }));
        if message.role == Role::User && !has_results {
            age += 1;
            continue;
        }
        if has_results && age >= expiry_turns {
            for part in &mut message.parts {
                if let MessagePart::ToolResult { content, .. } = part {
                    EXPIRED_TOOL_OUTPUT.clone_into(content);
                }
            }
            EXPIRED_TOOL_OUTPUT.clone_into(&mut message.content);
        }
    }
}

fn excerpt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}...")
}

fn user_message(inbound: &InboundMessage) -> Message {
    if inbound.media.is_empty() {
        Message::user(&inbound.text)
    } else {
        Message::user(format!(
            "{}\n[attachments: {}]",
            inbound.text,
            inbound.media.join(", ")
        ))
    }
}

async fn read_bootstrap(workspace: &Path, file: &str) -> Option<String> {
    let path = match safe_path(workspace, file, &[]) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(file, error = %e, "bootstrap file rejected");
            return None;
        }
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => {
            let body = body.trim();
            (!body.is_empty()).then(|| body.to_owned())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read bootstrap file");
            None
        }
    }
}

impl TurnPipeline {
    /// Record the user message and the refusal, then queue the audit entry.
    pub(super) async fn refuse(
        &self,
        state: &mut TurnState,
        reason: &str,
        sink: Option<&EventSink>,
    ) -> Result<(), PipelineError> {
        self.store
            .ensure_session(&state.agent.id, &state.inbound.session_key, &state.inbound.channel)
            .await?;
        self.store
            .append_message(&state.session_id, &user_message(&state.inbound))
            .await?;
        self.store
            .append_message(&state.session_id, &Message::assistant(REFUSAL_TEXT))
            .await?;
        tracing::warn!(
            agent = %state.agent.id,
            session = %state.session_id,
            reason,
            "input guard refused turn"
        );

        state.refused = true;
        REFUSAL_TEXT.clone_into(&mut state.response);
        state.audit.push(
            AuditRecord::new(state.inbound.sender_id.clone(), "guard.refusal")
                .with_role(state.inbound.sender_kind.as_str())
                .with_target(state.session_id.clone())
                .with_status("refused"),
        );
        events::emit(sink, TurnEvent::TextDelta(REFUSAL_TEXT.to_owned())).await;
        Ok(())
    }

    /// System prompt, bootstrap files and recalled notes.
    pub(super) async fn build_context(&self, pipeline: &PipelineConfig, state: &mut TurnState) {
        let mut sections = Vec::new();
        if let Some(prompt) = state
            .agent
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            sections.push(prompt.to_owned());
        }
        for file in &state.agent.bootstrap_files {
            if let Some(body) = read_bootstrap(&state.agent.workspace, file).await {
                sections.push(format!("## {file}\n{body}"));
            }
        }

        let notes = match self.store.recent_notes(&state.agent.id, NOTES_SCAN_LIMIT).await {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!(agent = %state.agent.id, error = %e, "note recall failed");
                Vec::new()
            }
        };
        let recalled = recall_notes(&state.inbound.text, &notes, pipeline);
        if !recalled.is_empty() {
            tracing::debug!(agent = %state.agent.id, notes = recalled.len(), "recalled notes");
            sections.push(format!("## Notes\n{}", recalled.join("\n---\n")));
        }

        state.system = (!sections.is_empty()).then(|| sections.join("\n\n"));
    }

    /// Bounded history, pending agent mail and the new user message.
    pub(super) async fn build_history(
        &self,
        pipeline: &PipelineConfig,
        state: &mut TurnState,
    ) -> Result<(), PipelineError> {
        let session_id = state.session_id.clone();
        self.store
            .ensure_session(&state.agent.id, &state.inbound.session_key, &state.inbound.channel)
            .await?;

        let limit = u32::try_from(pipeline.recall_limit).unwrap_or(u32::MAX);
        let mut summary = self.store.latest_summary(&session_id).await?;
        let after = summary.as_ref().map_or(0, |(_, seq)| *seq);
        let mut rows: Vec<HistoryRow> = self
            .store
            .load_history(&session_id, limit)
            .await?
            .into_iter()
            .filter(|r| r.seq > after)
            .collect();

        if distill::estimate_tokens(&rows) > pipeline.recall_token_cap {
            let (overflow, kept) = distill::split_to_budget(rows, pipeline.recall_token_cap / 2);
            let previous = summary.as_ref().map(|(text, _)| text.as_str());
            if let Some(text) = self.distill_rows(&state.agent, &session_id, previous, &overflow).await {
                let up_to = overflow.last().map_or(after, |r| r.seq);
                summary = Some((text, up_to));
            }
            rows = kept;
        }

        let mut messages = Vec::with_capacity(rows.len() + 3);
        if let Some((text, _)) = &summary {
            messages.push(Message::system(format!(
                "Summary of the earlier conversation:\n{text}"
            )));
        }
        messages.extend(rows.into_iter().map(|r| r.message));
        expire_tool_results(&mut messages, pipeline.tool_context_expiry_turns);

        let pending = self.store.pending_agent_messages(&state.agent.id).await?;
        if !pending.is_empty() {
            messages.push(Message::system(format_pending(&pending)));
            let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
            self.store.mark_surfaced(&ids).await?;
            tracing::debug!(agent = %state.agent.id, count = ids.len(), "surfaced agent messages");
        }

        let user = user_message(&state.inbound);
        let seq = self.store.append_message(&session_id, &user).await?;
        messages.push(user);
        state.user_seq = Some(seq);
        state.messages = messages;

        self.hooks
            .dispatch(&HookEvent::BeforeTurn(TurnStartInfo {
                agent_id: state.agent.id.clone(),
                session_id,
                seq,
                text: state.inbound.text.clone(),
            }))
            .await;
        Ok(())
    }

    /// Summarize `overflow` and persist the summary. `None` means the model
    /// call failed and the overflow is simply dropped from context.
    pub(super) async fn distill_rows(
        &self,
        agent: &AgentConfig,
        session_id: &str,
        previous: Option<&str>,
        overflow: &[HistoryRow],
    ) -> Option<String> {
        let last = overflow.last()?;
        self.hooks
            .dispatch(&HookEvent::BeforeDistill(DistillStartInfo {
                session_id: session_id.to_owned(),
                messages: overflow.len(),
            }))
            .await;

        let request = distill::summary_request(&agent.model, previous, overflow);
        let result = match self
            .router
            .complete_with_failover(&request, &agent.fallback_models)
            .await
        {
            Ok(response) if !response.text.trim().is_empty() => {
                let text = response.text.trim().to_owned();
                self.store
                    .save_summary(session_id, &text, last.seq)
                    .await
                    .map(|_| text)
                    .map_err(|e| e.to_string())
            }
            Ok(_) => Err("model returned an empty summary".to_owned()),
            Err(e) => Err(e.to_string()),
        };

        let summary = match result {
            Ok(text) => {
                tracing::info!(session = session_id, summarized = overflow.len(), "history distilled");
                Some(text)
            }
            Err(reason) => {
                tracing::warn!(session = session_id, error = %reason, "distillation failed, truncating history");
                None
            }
        };
        self.hooks
            .dispatch(&HookEvent::AfterDistill(DistillEndInfo {
                session_id: session_id.to_owned(),
                summarized: if summary.is_some() { overflow.len() } else { 0 },
                summarized_by_model: summary.is_some(),
            }))
            .await;
        summary
    }

    /// Summarize everything but the newest few messages of a session.
    ///
    /// Returns the new summary, or `None` when there was nothing to fold or
    /// the model call failed.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownAgent` for an unconfigured agent, or a
    /// store error.
    pub async fn distill_session(
        &self,
        agent_id: &str,
        session_key: &str,
    ) -> Result<Option<String>, PipelineError> {
        let config = self.config();
        let agent = config
            .agent(agent_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownAgent {
                agent_id: agent_id.to_owned(),
            })?;
        let session_id = warden_store::session_id(agent_id, session_key);
        let _session = self.locks.acquire(&session_id).await;

        let summary = self.store.latest_summary(&session_id).await?;
        let after = summary.as_ref().map_or(0, |(_, seq)| *seq);
        let rows = self.store.history_after(&session_id, after).await?;
        let (overflow, _) = distill::split_keep_recent(rows, distill::KEEP_RECENT);
        if overflow.is_empty() {
            return Ok(None);
        }
        let previous = summary.as_ref().map(|(text, _)| text.as_str());
        Ok(self.distill_rows(&agent, &session_id, previous, &overflow).await)
    }

    /// Write audit records through, persist the outcome, notify plugins and
    /// queue the memory flush. Audit records land even when the turn row
    /// cannot be saved.
    pub(super) async fn finalize(&self, state: TurnState) -> Result<TurnOutcome, PipelineError> {
        let cost_usd = self
            .cost
            .record(&state.agent.id, &state.agent.model, &state.usage);
        let outcome = state.outcome(cost_usd);

        if let Some(audit) = &self.audit {
            for record in state.audit {
                audit.append(record).await?;
            }
        }

        let saved = self
            .store
            .save_turn(&TurnRecord {
                session_id: outcome.session_id.clone(),
                agent_id: state.agent.id.clone(),
                response: outcome.response.clone(),
                tool_calls: outcome.tool_calls,
                usage: outcome.usage,
                refused: outcome.refused,
                partial: outcome.partial,
                loop_cap_reached: outcome.loop_cap_reached,
                cost_usd,
            })
            .await;

        self.hooks
            .dispatch(&HookEvent::AfterTurn(TurnEndInfo {
                agent_id: state.agent.id.clone(),
                session_id: outcome.session_id.clone(),
                response: outcome.response.clone(),
                tool_calls: outcome.tool_calls,
                refused: outcome.refused,
                partial: outcome.partial,
            }))
            .await;
        saved?;

        if !outcome.refused {
            let note = format!(
                "user: {}\nassistant: {}",
                excerpt(&state.inbound.text, NOTE_EXCERPT_CHARS),
                excerpt(&outcome.response, NOTE_EXCERPT_CHARS)
            );
            let store = self.store.clone();
            let policy = self.flush_policy;
            let agent_id = state.agent.id;
            let session_id = outcome.session_id.clone();
            tokio::spawn(async move {
                flush_notes(&store, &agent_id, &session_id, &[note], policy).await;
            });
        }

        tracing::info!(
            session = %outcome.session_id,
            tool_calls = outcome.tool_calls,
            input_tokens = outcome.usage.input_tokens,
            output_tokens = outcome.usage.output_tokens,
            refused = outcome.refused,
            partial = outcome.partial,
            loop_cap_reached = outcome.loop_cap_reached,
            "turn finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knobs() -> PipelineConfig {
        PipelineConfig {
            recall_min_score: 0.3,
            sufficiency_threshold: 0.7,
            sufficiency_min_hits: 2,
            notes_token_cap: 1_000,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn recall_ranks_by_overlap_and_drops_weak_matches() {
        let notes = vec![
            "weather in lisbon was sunny".to_owned(),
            "deploy pipeline uses docker compose".to_owned(),
            "docker deploy failed on staging".to_owned(),
        ];
        let recalled = recall_notes("why did the docker deploy fail", &notes, &knobs());
        assert_eq!(recalled.len(), 2);
        assert!(recalled.iter().all(|n| n.contains("docker")));
    }

    #[test]
    fn recall_stops_after_enough_strong_hits() {
        let notes: Vec<String> = (0..5).map(|i| format!("nginx restart run {i}")).collect();
        let recalled = recall_notes("nginx restart", &notes, &knobs());
        assert_eq!(recalled.len(), 2);
    }

    #[test]
    fn recall_respects_token_cap() {
        let notes = vec![format!("nginx {}", "a ".repeat(400)), "nginx short".to_owned()];
        let config = PipelineConfig {
            notes_token_cap: 50,
            ..knobs()
        };
        assert!(recall_notes("nginx", &notes, &config).len() <= 1);
    }

    #[test]
    fn recall_with_no_terms_is_empty() {
        assert!(recall_notes("a b", &["anything".to_owned()], &knobs()).is_empty());
    }

    fn tool_result(content: &str) -> Message {
        Message {
            role: Role::User,
            content: content.to_owned(),
            parts: vec![MessagePart::ToolResult {
                tool_use_id: "c".into(),
                content: content.to_owned(),
                is_error: false,
            }],
        }
    }

    #[test]
    fn old_tool_results_expire() {
        let mut messages = vec![
            Message::user("first"),
            tool_result("old output"),
            Message::user("second"),
            tool_result("recent output"),
        ];
        expire_tool_results(&mut messages, 1);
        assert_eq!(messages[1].content, EXPIRED_TOOL_OUTPUT);
        assert_eq!(messages[3].content, "recent output");
        match &messages[1].parts[0] {
            MessagePart::ToolResult { content, .. } => assert_eq!(content, EXPIRED_TOOL_OUTPUT),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn resolve_rejects_unknown_agent() {
        let err = resolve(&Config::default(), InboundMessage::new("ghost", "s", "hi")).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownAgent { agent_id } if agent_id == "ghost"));
    }

    #[test]
    fn resolve_builds_session_id() {
        let state = resolve(&Config::default(), InboundMessage::new("main", "chat", "hi")).unwrap();
        assert_eq!(state.session_id, "main:chat");
        assert_eq!(state.tool_calls, 0);
    }

    #[test]
    fn attachments_are_listed_in_the_user_message() {
        let inbound = InboundMessage::new("main", "s", "look").with_media(vec!["a.png".into()]);
        assert_eq!(user_message(&inbound).content, "look\n[attachments: a.png]");
    }
}
