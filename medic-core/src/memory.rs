//! In-process collaborators for tests and demos.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{ServiceError, StoreError};
use crate::incident::{AuditEntry, Incident, IncidentStatus};
use crate::ports::{AuditSink, IncidentStore};

#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn entries_for_incident(&self, incident_id: &str) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.incident_id == incident_id)
            .collect()
    }

    /// Action names for one incident, in append order.
    pub fn actions_for_incident(&self, incident_id: &str) -> Vec<String> {
        self.entries_for_incident(incident_id)
            .into_iter()
            .map(|entry| entry.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), ServiceError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ServiceError::Unavailable("audit log poisoned".into()))?;
        let mut entry = entry.clone();
        entry.id = Some(entries.len() as i64 + 1);
        entries.push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryIncidentStore {
    incidents: Mutex<BTreeMap<String, (Incident, Option<serde_json::Value>)>>,
}

impl MemoryIncidentStore {
    fn poisoned() -> StoreError {
        StoreError::Io(std::io::Error::other("incident store poisoned"))
    }

    pub fn status_details(&self, id: &str) -> Option<serde_json::Value> {
        self.incidents
            .lock()
            .ok()
            .and_then(|map| map.get(id).and_then(|(_, details)| details.clone()))
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn save(&self, incident: &Incident) -> Result<(), StoreError> {
        let mut map = self.incidents.lock().map_err(|_| Self::poisoned())?;
        if map.contains_key(&incident.id) {
            return Err(StoreError::AlreadyExists(incident.id.clone()));
        }
        map.insert(incident.id.clone(), (incident.clone(), None));
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: IncidentStatus,
        details: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut map = self.incidents.lock().map_err(|_| Self::poisoned())?;
        let (incident, stored_details) = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if incident.status.is_terminal() {
            return Err(StoreError::Immutable {
                id: id.to_string(),
                status: incident.status,
            });
        }
        incident.status = status;
        incident.updated_at = Utc::now();
        if details.is_some() {
            *stored_details = details;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Incident>, StoreError> {
        let map = self.incidents.lock().map_err(|_| Self::poisoned())?;
        Ok(map.get(id).map(|(incident, _)| incident.clone()))
    }

    async fn list_open(&self) -> Result<Vec<Incident>, StoreError> {
        let map = self.incidents.lock().map_err(|_| Self::poisoned())?;
        Ok(map
            .values()
            .filter(|(incident, _)| incident.status == IncidentStatus::Open)
            .map(|(incident, _)| incident.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{AuditResult, Severity};
    use serde_json::json;

    #[tokio::test]
    async fn audit_log_assigns_sequential_ids() {
        let log = MemoryAuditLog::default();
        for action in ["incident_received", "investigation_started"] {
            log.append(&AuditEntry::new("inc", action, AuditResult::Success, json!({})))
                .await
                .expect("append");
        }
        let ids: Vec<Option<i64>> = log.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(
            log.actions_for_incident("inc"),
            vec!["incident_received", "investigation_started"]
        );
    }

    #[tokio::test]
    async fn store_mirrors_sqlite_immutability() {
        let store = MemoryIncidentStore::default();
        let incident = Incident::with_id("inc", Severity::Medium, "fn", "x");
        store.save(&incident).await.expect("save");
        assert_eq!(store.list_open().await.expect("list").len(), 1);

        store
            .update_status("inc", IncidentStatus::Resolved, Some(json!({"checks": 3})))
            .await
            .expect("resolve");
        assert!(store.list_open().await.expect("list").is_empty());
        assert_eq!(store.status_details("inc"), Some(json!({"checks": 3})));

        let err = store
            .update_status("inc", IncidentStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Immutable { .. }));

        let err = store.save(&incident).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "inc"));
        assert_eq!(
            store.get("inc").await.expect("get").map(|i| i.status),
            Some(IncidentStatus::Resolved)
        );
    }
}
