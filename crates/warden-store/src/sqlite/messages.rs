use warden_llm::provider::{Message, MessagePart, Role};

use super::SqliteStore;
use crate::error::StoreError;

/// A stored history message with its per-session sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub seq: i64,
    pub message: Message,
}

fn decode(seq: i64, role: &str, content: String, parts_json: &str) -> HistoryRow {
    let parts: Vec<MessagePart> = serde_json::from_str(parts_json).unwrap_or_else(|e| {
        tracing::warn!(seq, error = %e, "failed to decode message parts, dropping them");
        Vec::new()
    });
    HistoryRow {
        seq,
        message: Message {
            role: Role::parse(role),
            content,
            parts,
        },
    }
}

impl SqliteStore {
    /// Append `message` to the session history and return its sequence number.
    ///
    /// Sequence numbers come from the session's own counter, so they keep
    /// growing after retention deletes older rows.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, the session does not exist,
    /// or the insert fails.
    pub async fn append_message(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<i64, StoreError> {
        let parts_json = serde_json::to_string(&message.parts)?;
        let mut tx = self.pool.begin().await?;
        let (seq,): (i64,) = sqlx::query_as(
            "UPDATE sessions SET last_seq = last_seq + 1 WHERE id = ? RETURNING last_seq",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO messages (session_id, seq, role, content, parts) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(seq)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(parts_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(seq)
    }

    /// Load the most recent messages for a session, up to `limit`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT seq, role, content, parts FROM (\
                SELECT seq, role, content, parts FROM messages \
                WHERE session_id = ? \
                ORDER BY seq DESC \
                LIMIT ?\
             ) ORDER BY seq ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(seq, role, content, parts)| decode(seq, &role, content, &parts))
            .collect())
    }

    /// Messages with a sequence number strictly greater than `after_seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn history_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT seq, role, content, parts FROM messages \
             WHERE session_id = ? AND seq > ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(seq, role, content, parts)| decode(seq, &role, content, &parts))
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn message_count(&self, session_id: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> (SqliteStore, String) {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let sid = store.ensure_session("a", "s", "cli").await.unwrap();
        (store, sid)
    }

    #[tokio::test]
    async fn sequence_numbers_follow_append_order() {
        let (store, sid) = store_with_session().await;
        assert_eq!(store.append_message(&sid, &Message::user("one")).await.unwrap(), 1);
        assert_eq!(store.append_message(&sid, &Message::assistant("two")).await.unwrap(), 2);
        assert_eq!(store.append_message(&sid, &Message::user("three")).await.unwrap(), 3);

        let other = store.ensure_session("a", "t", "cli").await.unwrap();
        assert_eq!(store.append_message(&other, &Message::user("x")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn load_history_returns_tail_in_order() {
        let (store, sid) = store_with_session().await;
        for i in 0..5 {
            store
                .append_message(&sid, &Message::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let rows = store.load_history(&sid, 3).await.unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r.message.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(rows[0].seq, 3);
    }

    #[tokio::test]
    async fn parts_roundtrip_through_json_column() {
        let (store, sid) = store_with_session().await;
        let mut msg = Message::assistant("calling");
        msg.parts.push(MessagePart::ToolUse {
            id: "c1".into(),
            name: "read".into(),
            input: serde_json::json!({"path": "a.txt"}),
        });
        store.append_message(&sid, &msg).await.unwrap();
        let rows = store.load_history(&sid, 10).await.unwrap();
        assert_eq!(rows[0].message, msg);
    }

    #[tokio::test]
    async fn history_after_skips_summarized_prefix() {
        let (store, sid) = store_with_session().await;
        for i in 0..4 {
            store
                .append_message(&sid, &Message::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let rows = store.history_after(&sid, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 3);
        assert_eq!(store.message_count(&sid).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn undecodable_parts_fall_back_to_plain_content() {
        let (store, sid) = store_with_session().await;
        sqlx::query(
            "INSERT INTO messages (session_id, seq, role, content, parts) \
             VALUES (?, 1, 'assistant', 'kept', 'not json')",
        )
        .bind(&sid)
        .execute(store.pool())
        .await
        .unwrap();

        let rows = store.load_history(&sid, 10).await.unwrap();
        assert_eq!(rows[0].message.content, "kept");
        assert!(rows[0].message.parts.is_empty());
    }

    #[tokio::test]
    async fn append_to_unknown_session_fails() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        assert!(store.append_message("a:missing", &Message::user("x")).await.is_err());
    }
}
