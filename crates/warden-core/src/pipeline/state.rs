use warden_llm::{Message, Usage};
use warden_tools::AuditRecord;

use super::{InboundMessage, TurnOutcome};
use crate::config::AgentConfig;

/// Mutable accumulator owned by one pipeline run. Created at resolve,
/// consumed by finalize.
#[derive(Debug)]
pub(crate) struct TurnState {
    pub agent: AgentConfig,
    pub session_id: String,
    pub inbound: InboundMessage,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Sequence number of this turn's user message once appended.
    pub user_seq: Option<i64>,
    pub usage: Usage,
    pub tool_calls: u32,
    pub response: String,
    pub refused: bool,
    pub partial: bool,
    pub loop_cap_reached: bool,
    /// Written through to the audit chain at finalize.
    pub audit: Vec<AuditRecord>,
}

impl TurnState {
    pub fn new(agent: AgentConfig, session_id: String, inbound: InboundMessage) -> Self {
        Self {
            agent,
            session_id,
            inbound,
            system: None,
            messages: Vec::new(),
            user_seq: None,
            usage: Usage::default(),
            tool_calls: 0,
            response: String::new(),
            refused: false,
            partial: false,
            loop_cap_reached: false,
            audit: Vec::new(),
        }
    }

    pub fn outcome(&self, cost_usd: f64) -> TurnOutcome {
        TurnOutcome {
            response: self.response.clone(),
            session_id: self.session_id.clone(),
            tool_calls: self.tool_calls,
            usage: self.usage,
            refused: self.refused,
            partial: self.partial,
            loop_cap_reached: self.loop_cap_reached,
            cost_usd,
        }
    }
}
