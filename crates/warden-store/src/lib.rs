//! SQLite-backed persistence for sessions, message history, the cross-agent
//! mailbox, turn outcomes and the audit log.

pub mod error;
pub mod sqlite;

pub use error::StoreError;
pub use sqlite::{AgentMessageRow, HistoryRow, SqliteStore, TurnRecord, session_id};
