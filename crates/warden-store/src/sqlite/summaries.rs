use super::SqliteStore;
use crate::error::StoreError;

impl SqliteStore {
    /// Save a summary covering the session history up to `up_to_seq` and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn save_summary(
        &self,
        session_id: &str,
        content: &str,
        up_to_seq: i64,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO summaries (session_id, content, up_to_seq) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(session_id)
        .bind(content)
        .bind(up_to_seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Most recent summary for the session as `(content, up_to_seq)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, i64)>, StoreError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT content, up_to_seq FROM summaries WHERE session_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Persist a free-form note flushed after a turn.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn save_note(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO notes (agent_id, session_id, content) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(agent_id)
        .bind(session_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Most recent notes for an agent, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_notes(&self, agent_id: &str, limit: u32) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT content FROM notes WHERE agent_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_summary_wins() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let sid = store.ensure_session("a", "s", "cli").await.unwrap();
        assert!(store.latest_summary(&sid).await.unwrap().is_none());

        store.save_summary(&sid, "first", 4).await.unwrap();
        store.save_summary(&sid, "second", 9).await.unwrap();
        assert_eq!(
            store.latest_summary(&sid).await.unwrap(),
            Some(("second".to_owned(), 9))
        );
    }

    #[tokio::test]
    async fn notes_newest_first() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        store.save_note("a", "a:s", "one").await.unwrap();
        store.save_note("a", "a:s", "two").await.unwrap();
        store.save_note("b", "b:s", "other").await.unwrap();
        assert_eq!(store.recent_notes("a", 10).await.unwrap(), vec!["two", "one"]);
    }
}
