use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit_log::ensure_parent_dir;
use crate::error::StoreError;
use crate::incident::{Incident, IncidentStatus};
use crate::ports::IncidentStore;

/// Incident records keyed by id. The full incident is stored as JSON next to
/// an indexed status column used for listing.
#[derive(Clone)]
pub struct SqliteIncidentStore {
    db_path: Arc<PathBuf>,
}

impl SqliteIncidentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        ensure_parent_dir(&db_path)?;

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                status_details TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);
            ",
        )?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Incident>, StoreError> {
        let body = conn
            .query_row(
                "SELECT body FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn write(
        conn: &Connection,
        incident: &Incident,
        details: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(incident)?;
        let details = details.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO incidents (id, status, body, status_details, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                status_details = COALESCE(excluded.status_details, incidents.status_details),
                updated_at = excluded.updated_at",
            params![
                incident.id,
                incident.status.as_str(),
                body,
                details,
                incident.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Details recorded with the most recent status change that carried any.
    pub fn status_details(&self, id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let details = conn
            .query_row(
                "SELECT status_details FROM incidents WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(details.map(|d| serde_json::from_str(&d)).transpose()?)
    }
}

fn guard_mutable(existing: &Incident) -> Result<(), StoreError> {
    if existing.status.is_terminal() {
        return Err(StoreError::Immutable {
            id: existing.id.clone(),
            status: existing.status,
        });
    }
    Ok(())
}

#[async_trait]
impl IncidentStore for SqliteIncidentStore {
    async fn save(&self, incident: &Incident) -> Result<(), StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let body = serde_json::to_string(incident)?;
        let inserted = conn.execute(
            "INSERT INTO incidents (id, status, body, status_details, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                incident.id,
                incident.status.as_str(),
                body,
                incident.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(incident.id.clone()));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        details: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let mut incident =
            Self::load(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        guard_mutable(&incident)?;

        incident.status = status;
        incident.updated_at = Utc::now();
        Self::write(&conn, &incident, details.as_ref())
    }

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        Self::load(&conn, id)
    }

    async fn list_open(&self) -> Result<Vec<Incident>, StoreError> {
        let conn = Connection::open(&*self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT body FROM incidents
             WHERE status = ?1
             ORDER BY updated_at ASC",
        )?;
        let bodies = stmt
            .query_map(params![IncidentStatus::Open.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::Severity;
    use serde_json::json;

    fn db_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        format!("/tmp/lambda-medic-tests/{name}-{nanos}.db")
    }

    #[tokio::test]
    async fn save_get_and_list_open() {
        let store = SqliteIncidentStore::open(db_path("store-list")).expect("open");
        let a = Incident::with_id("inc-a", Severity::High, "fn-a", "errors");
        let mut b = Incident::with_id("inc-b", Severity::Low, "fn-b", "slow");
        b.transition(IncidentStatus::Investigating).expect("transition");

        store.save(&a).await.expect("save a");
        store.save(&b).await.expect("save b");

        let loaded = store.get("inc-a").await.expect("get").expect("present");
        assert_eq!(loaded, a);
        assert!(store.get("missing").await.expect("get").is_none());

        let open: Vec<String> = store
            .list_open()
            .await
            .expect("list")
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(open, vec!["inc-a".to_string()]);
    }

    #[tokio::test]
    async fn terminal_incidents_are_immutable() {
        let store = SqliteIncidentStore::open(db_path("store-immutable")).expect("open");
        let incident = Incident::with_id("inc-1", Severity::Critical, "fn", "down");
        store.save(&incident).await.expect("save");

        store
            .update_status("inc-1", IncidentStatus::Failed, Some(json!({"reason": "boom"})))
            .await
            .expect("fail");
        assert_eq!(
            store.status_details("inc-1").expect("details"),
            Some(json!({"reason": "boom"}))
        );

        let err = store
            .update_status("inc-1", IncidentStatus::Open, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable { status: IncidentStatus::Failed, .. }));

    }

    #[tokio::test]
    async fn save_never_overwrites_an_existing_incident() {
        let store = SqliteIncidentStore::open(db_path("store-duplicate")).expect("open");
        let incident = Incident::with_id("inc-1", Severity::High, "fn", "timeouts");
        store.save(&incident).await.expect("save");
        store
            .update_status("inc-1", IncidentStatus::Investigating, None)
            .await
            .expect("investigate");

        let err = store.save(&incident).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "inc-1"));
        let stored = store.get("inc-1").await.expect("get").expect("present");
        assert_eq!(stored.status, IncidentStatus::Investigating);
        assert!(store.list_open().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_incident_is_not_found() {
        let store = SqliteIncidentStore::open(db_path("store-missing")).expect("open");
        let err = store
            .update_status("nope", IncidentStatus::Investigating, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "nope"));
    }
}
