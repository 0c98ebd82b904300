//! Tamper-evident, hash-linked audit log of privileged actions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::executor::BoxFuture;

/// `previous_checksum` of the first entry.
pub const GENESIS: &str = "genesis";
const DELIMITER: &str = "|";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage failed: {0}")]
    Storage(String),
}

/// What gets recorded; the chain adds id, timestamp and checksums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor: String,
    pub role: String,
    pub action: String,
    pub target: Option<String>,
    pub ip: String,
    pub status: String,
}

impl AuditRecord {
    #[must_use]
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            role: "agent".into(),
            action: action.into(),
            target: None,
            ip: "local".into(),
            status: "ok".into(),
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub actor: String,
    pub role: String,
    pub action: String,
    pub target: Option<String>,
    pub ip: String,
    pub status: String,
    pub checksum: String,
    pub previous_checksum: String,
}

impl AuditEntry {
    /// Checksum recomputed from the stored fields.
    #[must_use]
    pub fn expected_checksum(&self) -> String {
        compute_checksum(
            &self.timestamp,
            &AuditRecord {
                actor: self.actor.clone(),
                role: self.role.clone(),
                action: self.action.clone(),
                target: self.target.clone(),
                ip: self.ip.clone(),
                status: self.status.clone(),
            },
            &self.previous_checksum,
        )
    }
}

/// blake3 over every field except the checksum itself, joined with `|`.
#[must_use]
pub fn compute_checksum(timestamp: &str, record: &AuditRecord, previous: &str) -> String {
    let joined = [
        timestamp,
        &record.actor,
        &record.role,
        &record.action,
        record.target.as_deref().unwrap_or(""),
        &record.ip,
        &record.status,
        previous,
    ]
    .join(DELIMITER);
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}

/// Persistence seam for the chain. Implementations store rows verbatim and
/// return them in ascending id order.
pub trait AuditStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `AuditError::Storage` on I/O failure.
    fn last_entry(&self) -> BoxFuture<'_, Result<Option<AuditEntry>, AuditError>>;

    /// # Errors
    ///
    /// Returns `AuditError::Storage` on I/O failure.
    fn insert<'a>(&'a self, entry: &'a AuditEntry) -> BoxFuture<'a, Result<(), AuditError>>;

    /// # Errors
    ///
    /// Returns `AuditError::Storage` on I/O failure.
    fn entries(&self) -> BoxFuture<'_, Result<Vec<AuditEntry>, AuditError>>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    rows: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to stored rows, bypassing the chain. Simulates external edits.
    pub async fn modify_rows<F: FnOnce(&mut Vec<AuditEntry>)>(&self, f: F) {
        f(&mut *self.rows.lock().await);
    }
}

impl AuditStore for InMemoryAuditStore {
    fn last_entry(&self) -> BoxFuture<'_, Result<Option<AuditEntry>, AuditError>> {
        Box::pin(async move { Ok(self.rows.lock().await.last().cloned()) })
    }

    fn insert<'a>(&'a self, entry: &'a AuditEntry) -> BoxFuture<'a, Result<(), AuditError>> {
        Box::pin(async move {
            self.rows.lock().await.push(entry.clone());
            Ok(())
        })
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<AuditEntry>, AuditError>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().await.clone();
            rows.sort_by_key(|e| e.id);
            Ok(rows)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditVerification {
    pub valid: bool,
    pub total: usize,
    pub checked: usize,
    pub tamper_index: Option<i64>,
    pub reason: Option<String>,
}

/// Append-only chain writer and verifier. Appends are serialized.
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain").finish_non_exhaustive()
    }
}

impl AuditChain {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Link `record` onto the chain and persist it.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Storage` if the store fails; the chain is left unchanged.
    pub async fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let _guard = self.write_lock.lock().await;
        let last = self.store.last_entry().await?;
        let (id, previous) = match last {
            Some(prev) => (prev.id + 1, prev.checksum),
            None => (1, GENESIS.to_owned()),
        };
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string();
        let checksum = compute_checksum(&timestamp, &record, &previous);
        let entry = AuditEntry {
            id,
            timestamp,
            actor: record.actor,
            role: record.role,
            action: record.action,
            target: record.target,
            ip: record.ip,
            status: record.status,
            checksum,
            previous_checksum: previous,
        };
        self.store.insert(&entry).await?;
        tracing::debug!(id, action = %entry.action, actor = %entry.actor, "audit entry appended");
        Ok(entry)
    }

    /// Replay the log from genesis. Reports the first offending id; never repairs.
    ///
    /// # Errors
    ///
    /// Returns `AuditError::Storage` if the entries cannot be read.
    pub async fn verify(&self) -> Result<AuditVerification, AuditError> {
        let entries = self.store.entries().await?;
        Ok(verify_entries(&entries))
    }
}

/// Pure verification over rows already sorted by ascending id.
#[must_use]
pub fn verify_entries(entries: &[AuditEntry]) -> AuditVerification {
    let mut expected_previous = GENESIS.to_owned();
    let mut checked = 0;
    for entry in entries {
        if entry.previous_checksum != expected_previous {
            return broken(
                entries.len(),
                checked,
                entry.id,
                format!("chain break at entry {}: previous checksum does not match", entry.id),
            );
        }
        if entry.expected_checksum() != entry.checksum {
            return broken(
                entries.len(),
                checked,
                entry.id,
                format!("checksum mismatch at entry {}", entry.id),
            );
        }
        expected_previous.clone_from(&entry.checksum);
        checked += 1;
    }
    AuditVerification {
        valid: true,
        total: entries.len(),
        checked,
        tamper_index: None,
        reason: None,
    }
}

fn broken(total: usize, checked: usize, id: i64, reason: String) -> AuditVerification {
    tracing::error!(id, %reason, "audit chain verification failed");
    AuditVerification {
        valid: false,
        total,
        checked,
        tamper_index: Some(id),
        reason: Some(reason),
    }
}
