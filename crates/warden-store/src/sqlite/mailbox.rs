use super::SqliteStore;
use crate::error::StoreError;

/// A cross-agent message waiting to be surfaced in the recipient's next turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessageRow {
    pub id: i64,
    pub from_agent: String,
    pub to_agent: String,
    pub kind: String,
    pub content: String,
    pub response: Option<String>,
}

impl SqliteStore {
    /// Queue a message for `to_agent` and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn enqueue_agent_message(
        &self,
        from_agent: &str,
        to_agent: &str,
        kind: &str,
        content: &str,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO agent_messages (from_agent, to_agent, kind, content) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(from_agent)
        .bind(to_agent)
        .bind(kind)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Attach the recipient's answer to a queued message.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_agent_response(&self, id: i64, response: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE agent_messages SET response = ? WHERE id = ?")
            .bind(response)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unsurfaced messages addressed to `agent_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_agent_messages(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AgentMessageRow>, StoreError> {
        let rows: Vec<(i64, String, String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, from_agent, to_agent, kind, content, response FROM agent_messages \
             WHERE to_agent = ? AND surfaced = 0 ORDER BY id ASC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, from_agent, to_agent, kind, content, response)| AgentMessageRow {
                    id,
                    from_agent,
                    to_agent,
                    kind,
                    content,
                    response,
                },
            )
            .collect())
    }

    /// Mark the given messages surfaced so they are not shown again.
    ///
    /// # Errors
    ///
    /// Returns an error if any update fails.
    pub async fn mark_surfaced(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE agent_messages SET surfaced = 1, surfaced_at = datetime('now') WHERE id = ?",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_messages_surface_once() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let first = store
            .enqueue_agent_message("ops", "research", "message", "status?")
            .await
            .unwrap();
        store
            .enqueue_agent_message("ops", "research", "ask", "ping")
            .await
            .unwrap();
        store
            .enqueue_agent_message("ops", "writer", "message", "not for research")
            .await
            .unwrap();
        store.set_agent_response(first, "all green").await.unwrap();

        let pending = store.pending_agent_messages("research").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].response.as_deref(), Some("all green"));
        assert_eq!(pending[1].kind, "ask");

        let ids: Vec<i64> = pending.iter().map(|m| m.id).collect();
        store.mark_surfaced(&ids).await.unwrap();
        assert!(store.pending_agent_messages("research").await.unwrap().is_empty());
        assert_eq!(store.pending_agent_messages("writer").await.unwrap().len(), 1);
    }
}
