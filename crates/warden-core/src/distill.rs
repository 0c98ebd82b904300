//! Summarizing history that no longer fits the recall budget.

use std::fmt::Write as _;

use warden_llm::{CompletionRequest, Message, MessagePart};
use warden_store::HistoryRow;

/// Rows `distill_session` leaves verbatim after summarizing the rest.
pub const KEEP_RECENT: usize = 4;

const SUMMARY_MAX_TOKENS: u32 = 1024;
const ROW_CHARS: usize = 2_000;

const SUMMARY_SYSTEM: &str = "You condense conversation transcripts for an agent's long-term context. \
Keep decisions, facts, file paths, commands and open tasks. Drop pleasantries. \
Reply with the summary only.";

#[must_use]
pub fn estimate_tokens(rows: &[HistoryRow]) -> usize {
    rows.iter().map(|r| r.message.estimated_tokens()).sum()
}

/// Split into `(overflow, kept)` where `kept` is the newest suffix fitting
/// `budget` tokens. At least the newest row is always kept.
#[must_use]
pub fn split_to_budget(mut rows: Vec<HistoryRow>, budget: usize) -> (Vec<HistoryRow>, Vec<HistoryRow>) {
    let mut used = 0;
    let mut cut = rows.len();
    for (i, row) in rows.iter().enumerate().rev() {
        let cost = row.message.estimated_tokens();
        if cut < rows.len() && used + cost > budget {
            break;
        }
        used += cost;
        cut = i;
    }
    let kept = rows.split_off(cut);
    (rows, kept)
}

/// Split into `(overflow, kept)` keeping the newest `keep` rows.
#[must_use]
pub fn split_keep_recent(mut rows: Vec<HistoryRow>, keep: usize) -> (Vec<HistoryRow>, Vec<HistoryRow>) {
    let cut = rows.len().saturating_sub(keep);
    let kept = rows.split_off(cut);
    (rows, kept)
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= ROW_CHARS {
        return text.to_owned();
    }
    let head: String = text.chars().take(ROW_CHARS).collect();
    format!("{head} [...]")
}

fn render_row(out: &mut String, row: &HistoryRow) {
    let role = row.message.role.as_str();
    if !row.message.content.is_empty() {
        let _ = writeln!(out, "{role}: {}", excerpt(&row.message.content));
    }
    for part in &row.message.parts {
        match part {
            MessagePart::Text { .. } => {}
            MessagePart::ToolUse { name, input, .. } => {
                let _ = writeln!(out, "{role} called {name}({})", excerpt(&input.to_string()));
            }
            MessagePart::ToolResult {
                content, is_error, ..
            } => {
                let label = if *is_error { "tool error" } else { "tool result" };
                let _ = writeln!(out, "{label}: {}", excerpt(content));
            }
        }
    }
}

/// Build the summarization request, folding in the previous summary so the
/// new one replaces it.
#[must_use]
pub fn summary_request(model: &str, previous: Option<&str>, rows: &[HistoryRow]) -> CompletionRequest {
    let mut prompt = String::new();
    if let Some(previous) = previous {
        let _ = write!(prompt, "Existing summary:\n{previous}\n\n");
    }
    prompt.push_str("Conversation to fold into the summary:\n");
    for row in rows {
        render_row(&mut prompt, row);
    }

    let mut request = CompletionRequest::new(model, vec![Message::user(prompt)]);
    request.system = Some(SUMMARY_SYSTEM.to_owned());
    request.max_tokens = SUMMARY_MAX_TOKENS;
    request
}
