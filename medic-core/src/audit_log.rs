use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ServiceError, StoreError};
use crate::incident::{AuditEntry, AuditResult};
use crate::ports::AuditSink;

/// Appends to `sink`, logging instead of failing: the audit trail never
/// aborts the pipeline.
pub async fn record(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(err) = sink.append(&entry).await {
        tracing::warn!(
            incident_id = %entry.incident_id,
            action = %entry.action,
            error = %err,
            "audit append failed"
        );
    }
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Append-only audit table in SQLite. A connection is opened per call.
#[derive(Clone)]
pub struct SqliteAuditLog {
    db_path: Arc<PathBuf>,
}

impl SqliteAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        ensure_parent_dir(&db_path)?;

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS audit_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                details TEXT NOT NULL,
                result TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_incident ON audit_entries(incident_id);
            CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_entries(timestamp);
            ",
        )?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    pub fn insert(&self, entry: &AuditEntry) -> Result<i64, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let details = serde_json::to_string(&entry.details)?;

        conn.execute(
            "INSERT INTO audit_entries (incident_id, timestamp, action, actor, details, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.incident_id,
                entry.timestamp.to_rfc3339(),
                entry.action,
                entry.actor,
                details,
                entry.result.as_str(),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn entries_for_incident(&self, incident_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, timestamp, action, actor, details, result
             FROM audit_entries
             WHERE incident_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Entries with an id greater than `after_id`, for incremental tailing.
    pub fn entries_after(&self, after_id: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, timestamp, action, actor, details, result
             FROM audit_entries
             WHERE id > ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![after_id], map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn latest_entry_id(&self) -> Result<Option<i64>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let latest = conn
            .query_row("SELECT MAX(id) FROM audit_entries", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?;
        Ok(latest.flatten())
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), ServiceError> {
        self.insert(entry)
            .map(|_| ())
            .map_err(|e| ServiceError::Unavailable(format!("audit log: {e}")))
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let text_err = |index: usize, err: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, err)
    };

    let timestamp: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| text_err(2, Box::new(e)))?;

    let details: String = row.get(5)?;
    let details = serde_json::from_str(&details).map_err(|e| text_err(5, Box::new(e)))?;

    let result: String = row.get(6)?;
    let result = AuditResult::parse(&result)
        .ok_or_else(|| text_err(6, format!("unknown audit result '{result}'").into()))?;

    Ok(AuditEntry {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        timestamp,
        action: row.get(3)?,
        actor: row.get(4)?,
        details,
        result,
    })
}
