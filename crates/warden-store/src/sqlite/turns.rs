use warden_llm::provider::Usage;

use super::{SqliteStore, to_i64};
use crate::error::StoreError;

/// Persisted shape of a finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub session_id: String,
    pub agent_id: String,
    pub response: String,
    pub tool_calls: u32,
    pub usage: Usage,
    pub refused: bool,
    pub partial: bool,
    pub loop_cap_reached: bool,
    pub cost_usd: f64,
}

impl SqliteStore {
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn save_turn(&self, turn: &TurnRecord) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO turns (session_id, agent_id, response, tool_calls, input_tokens, \
             output_tokens, cache_read_tokens, cache_write_tokens, refused, partial, \
             loop_cap_reached, cost_usd) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&turn.session_id)
        .bind(&turn.agent_id)
        .bind(&turn.response)
        .bind(turn.tool_calls)
        .bind(to_i64(turn.usage.input_tokens))
        .bind(to_i64(turn.usage.output_tokens))
        .bind(to_i64(turn.usage.cache_read_tokens))
        .bind(to_i64(turn.usage.cache_write_tokens))
        .bind(turn.refused)
        .bind(turn.partial)
        .bind(turn.loop_cap_reached)
        .bind(turn.cost_usd)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn turn_count(&self, session_id: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM turns WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Total recorded spend for an agent across all turns.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn agent_spend(&self, agent_id: &str) -> Result<f64, StoreError> {
        let row: (f64,) =
            sqlx::query_as("SELECT COALESCE(SUM(cost_usd), 0.0) FROM turns WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}
