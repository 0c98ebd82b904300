use super::SqliteStore;
use crate::error::StoreError;

fn age_modifier(days: u32) -> String {
    format!("-{days} days")
}

impl SqliteStore {
    /// Delete sessions idle for at least `idle_days`; their history cascades.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_expired_sessions(&self, idle_days: u32) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM sessions WHERE last_active_at <= datetime('now', ?)")
            .bind(age_modifier(idle_days))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Delete history messages older than `days`, across all sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_old_messages(&self, days: u32) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM messages WHERE created_at <= datetime('now', ?)")
            .bind(age_modifier(days))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Delete mailbox rows that were surfaced at least `days` ago.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_surfaced_mail(&self, days: u32) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "DELETE FROM agent_messages WHERE surfaced = 1 \
             AND COALESCE(surfaced_at, created_at) <= datetime('now', ?)",
        )
        .bind(age_modifier(days))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Delete turn outcome rows older than `days`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_old_turns(&self, days: u32) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM turns WHERE created_at <= datetime('now', ?)")
            .bind(age_modifier(days))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use warden_llm::provider::Message;

    use super::*;

    #[tokio::test]
    async fn recent_rows_survive_long_windows() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let sid = store.ensure_session("a", "s", "cli").await.unwrap();
        store.append_message(&sid, &Message::user("hi")).await.unwrap();
        assert_eq!(store.purge_expired_sessions(30).await.unwrap(), 0);
        assert_eq!(store.purge_old_messages(30).await.unwrap(), 0);
        assert_eq!(store.message_count(&sid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_day_window_purges_and_cascades() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let sid = store.ensure_session("a", "s", "cli").await.unwrap();
        store.append_message(&sid, &Message::user("hi")).await.unwrap();
        store.append_message(&sid, &Message::assistant("yo")).await.unwrap();

        assert_eq!(store.purge_expired_sessions(0).await.unwrap(), 1);
        assert_eq!(store.message_count(&sid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_surfaced_mail_is_purged() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let seen = store
            .enqueue_agent_message("a", "b", "message", "seen")
            .await
            .unwrap();
        store
            .enqueue_agent_message("a", "b", "message", "unseen")
            .await
            .unwrap();
        store.mark_surfaced(&[seen]).await.unwrap();

        assert_eq!(store.purge_surfaced_mail(0).await.unwrap(), 1);
        assert_eq!(store.pending_agent_messages("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purged_session_keeps_counting_past_its_summary() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let sid = store.ensure_session("a", "s", "cli").await.unwrap();
        for i in 0..5 {
            store
                .append_message(&sid, &Message::user(format!("m{i}")))
                .await
                .unwrap();
        }
        store.save_summary(&sid, "earlier chat", 5).await.unwrap();

        assert_eq!(store.purge_old_messages(0).await.unwrap(), 5);
        let seq = store.append_message(&sid, &Message::user("new")).await.unwrap();
        assert_eq!(seq, 6);

        let (_, after) = store.latest_summary(&sid).await.unwrap().unwrap();
        let visible = store.history_after(&sid, after).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].message.content, "new");
    }
}

