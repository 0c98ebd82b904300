use warden_tools::audit::{AuditEntry, AuditError, AuditStore};
use warden_tools::executor::BoxFuture;

use super::SqliteStore;

type AuditRow = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
);

fn storage(e: sqlx::Error) -> AuditError {
    AuditError::Storage(e.to_string())
}

fn to_entry(row: AuditRow) -> AuditEntry {
    let (id, timestamp, actor, role, action, target, ip, status, checksum, previous_checksum) = row;
    AuditEntry {
        id,
        timestamp,
        actor,
        role,
        action,
        target,
        ip,
        status,
        checksum,
        previous_checksum,
    }
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, actor, role, action, target, ip, status, \
                              checksum, previous_checksum FROM audit_log";

impl AuditStore for SqliteStore {
    fn last_entry(&self) -> BoxFuture<'_, Result<Option<AuditEntry>, AuditError>> {
        Box::pin(async move {
            let row: Option<AuditRow> =
                sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT 1"))
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage)?;
            Ok(row.map(to_entry))
        })
    }

    fn insert<'a>(&'a self, entry: &'a AuditEntry) -> BoxFuture<'a, Result<(), AuditError>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO audit_log (id, timestamp, actor, role, action, target, ip, status, \
                 checksum, previous_checksum) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.id)
            .bind(&entry.timestamp)
            .bind(&entry.actor)
            .bind(&entry.role)
            .bind(&entry.action)
            .bind(entry.target.as_deref())
            .bind(&entry.ip)
            .bind(&entry.status)
            .bind(&entry.checksum)
            .bind(&entry.previous_checksum)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            Ok(())
        })
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<AuditEntry>, AuditError>> {
        Box::pin(async move {
            let rows: Vec<AuditRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
            Ok(rows.into_iter().map(to_entry).collect())
        })
    }
}
