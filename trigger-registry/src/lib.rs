use serde::{Deserialize, Serialize};

pub const INCIDENT_SCHEMA_V1: &str = "incident.v1";

/// Canonical shape every inbound trigger is normalized into before an
/// incident is opened for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncidentTriggerV1 {
    pub schema: String,
    pub id: Option<String>,
    pub description: String,
    pub severity: String,
    pub resource_id: String,
    pub source: String,
}

pub fn validate_trigger_v1(trigger: &IncidentTriggerV1) -> Result<(), String> {
    if trigger.schema != INCIDENT_SCHEMA_V1 {
        return Err(format!("unsupported schema '{}'", trigger.schema));
    }
    if trigger.description.trim().is_empty() {
        return Err("description is required".into());
    }
    if trigger.resource_id.trim().is_empty() {
        return Err("resource_id is required".into());
    }
    if let Some(id) = &trigger.id {
        if id.trim().is_empty() {
            return Err("id must not be blank when present".into());
        }
    }
    match trigger.severity.to_lowercase().as_str() {
        "low" | "medium" | "high" | "critical" => {}
        other => return Err(format!("invalid severity '{other}'")),
    }
    Ok(())
}

/// Normalizes a loosely shaped webhook payload. Accepts a few common
/// aliases (`title`, `function_name`, `alarm_name`) that alerting tools use.
pub fn parse_generic(payload: &serde_json::Value) -> Result<IncidentTriggerV1, String> {
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| payload.get(*k).and_then(serde_json::Value::as_str))
            .map(ToString::to_string)
    };

    let trigger = IncidentTriggerV1 {
        schema: INCIDENT_SCHEMA_V1.into(),
        id: str_field(&["id", "incident_id"]),
        description: str_field(&["description", "title", "alarm_name"]).unwrap_or_default(),
        severity: str_field(&["severity"]).unwrap_or_else(|| "high".into()),
        resource_id: str_field(&["resource_id", "function_name"]).unwrap_or_default(),
        source: str_field(&["source"]).unwrap_or_else(|| "generic".into()),
    };
    validate_trigger_v1(&trigger)?;
    Ok(trigger)
}
