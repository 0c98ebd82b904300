use super::SqliteStore;
use crate::error::StoreError;

/// Stable session id for an agent and the caller-supplied session key.
#[must_use]
pub fn session_id(agent_id: &str, session_key: &str) -> String {
    format!("{agent_id}:{session_key}")
}

impl SqliteStore {
    /// Create the session for `(agent_id, session_key)` if needed, touch its
    /// activity timestamp and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn ensure_session(
        &self,
        agent_id: &str,
        session_key: &str,
        channel: &str,
    ) -> Result<String, StoreError> {
        let id = session_id(agent_id, session_key);
        sqlx::query(
            "INSERT INTO sessions (id, agent_id, session_key, channel) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET last_active_at = datetime('now')",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(session_key)
        .bind(channel)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Sessions belonging to `agent_id`, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn sessions_for_agent(&self, agent_id: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM sessions WHERE agent_id = ? ORDER BY last_active_at DESC, id ASC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_session_is_idempotent() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let a = store.ensure_session("ops", "main", "cli").await.unwrap();
        let b = store.ensure_session("ops", "main", "cli").await.unwrap();
        assert_eq!(a, "ops:main");
        assert_eq!(a, b);
        assert!(store.session_exists(&a).await.unwrap());
        assert!(!store.session_exists("ops:other").await.unwrap());
        assert_eq!(store.sessions_for_agent("ops").await.unwrap(), vec![a]);
    }
}
