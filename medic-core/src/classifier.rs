//! Pure interpretation of reasoning-service prose. Kept free of I/O so the
//! policy that turns model output into control input can be tested alone.

use crate::incident::{ActionType, RemediationAction};

pub const DEFAULT_MEMORY_MB: u32 = 512;
pub const DEFAULT_TIMEOUT_SECS: u32 = 30;
pub const UNKNOWN_ROOT_CAUSE: &str = "unknown";

/// First non-blank line of the response, trimmed.
pub fn extract_root_cause(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches(['#', '*', '-', ' ']).trim().to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| UNKNOWN_ROOT_CAUSE.to_string())
}

/// Keyword rules, case-insensitive:
/// - "memory" or "timeout" -> `update_config` (512 MB, 30 s) at order 1
/// - "restart" or "redeploy" -> `restart_service` at order 2
/// - neither -> a single `custom` action carrying the narrative
pub fn classify_remediation(narrative: &str) -> Vec<RemediationAction> {
    let text = narrative.to_lowercase();
    let mut actions = Vec::new();

    if text.contains("memory") || text.contains("timeout") {
        actions.push(
            RemediationAction::new(
                ActionType::UpdateConfig,
                1,
                "Raise memory and timeout to safe defaults",
            )
            .with_param("memory_mb", DEFAULT_MEMORY_MB)
            .with_param("timeout_secs", DEFAULT_TIMEOUT_SECS),
        );
    }
    if text.contains("restart") || text.contains("redeploy") {
        actions.push(RemediationAction::new(
            ActionType::RestartService,
            2,
            "Force a redeployment of the function",
        ));
    }
    if actions.is_empty() {
        actions.push(
            RemediationAction::new(ActionType::Custom, 1, "Manual remediation required")
                .with_param("note", narrative.trim())
                .with_param("manual", true),
        );
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_is_first_non_blank_line() {
        assert_eq!(
            extract_root_cause("\n\n## Timeout set to 1s\nmore detail"),
            "Timeout set to 1s"
        );
        assert_eq!(extract_root_cause("   \n"), UNKNOWN_ROOT_CAUSE);
        assert_eq!(extract_root_cause(""), UNKNOWN_ROOT_CAUSE);
    }

    #[test]
    fn memory_and_timeout_yield_single_update_config() {
        let actions =
            classify_remediation("The function hits its TIMEOUT because memory is too low.");
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.action_type, ActionType::UpdateConfig);
        assert_eq!(action.order, 1);
        assert_eq!(action.param_f64("memory_mb"), Some(512.0));
        assert_eq!(action.param_f64("timeout_secs"), Some(30.0));
    }

    #[test]
    fn redeploy_adds_restart_at_order_two() {
        let actions = classify_remediation("Increase memory, then redeploy the function.");
        let types: Vec<ActionType> = actions.iter().map(|a| a.action_type).collect();
        assert_eq!(types, vec![ActionType::UpdateConfig, ActionType::RestartService]);
        assert_eq!(actions[1].order, 2);
    }

    #[test]
    fn restart_alone() {
        let actions = classify_remediation("Restart it.");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::RestartService);
    }

    #[test]
    fn unmatched_narrative_falls_back_to_custom() {
        let actions = classify_remediation("  Rotate the leaked database credentials. ");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::Custom);
        assert_eq!(
            actions[0].parameters["note"],
            "Rotate the leaked database credentials."
        );
    }
}
