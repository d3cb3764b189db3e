//! Guardrails evaluated over a candidate action list. Any failed check means
//! the plan needs external approval before it may run.

use medic_effects::{all_reversible, Effectful};
use serde::{Deserialize, Serialize};

use crate::incident::{RemediationAction, SafetyCheck, SafetyCheckKind};

/// Platform ceilings for the target resource class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_actions: usize,
    pub max_memory_mb: u32,
    pub max_timeout_secs: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        // AWS Lambda hard limits.
        Self {
            max_actions: 5,
            max_memory_mb: 10_240,
            max_timeout_secs: 900,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SafetyGate {
    limits: SafetyLimits,
}

impl SafetyGate {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Evaluates every rule independently; the order of the returned checks
    /// is stable.
    pub fn evaluate(&self, actions: &[RemediationAction]) -> Vec<SafetyCheck> {
        vec![
            self.rate_limit(actions),
            self.resource_limit(actions),
            rollback_available(actions),
        ]
    }

    fn rate_limit(&self, actions: &[RemediationAction]) -> SafetyCheck {
        let passed = actions.len() <= self.limits.max_actions;
        SafetyCheck {
            kind: SafetyCheckKind::RateLimit,
            passed,
            details: format!(
                "{} action(s) planned, limit {}",
                actions.len(),
                self.limits.max_actions
            ),
        }
    }

    fn resource_limit(&self, actions: &[RemediationAction]) -> SafetyCheck {
        let ceilings = [
            ("memory_mb", f64::from(self.limits.max_memory_mb)),
            ("timeout_secs", f64::from(self.limits.max_timeout_secs)),
        ];

        let violations: Vec<String> = actions
            .iter()
            .flat_map(|action| {
                ceilings.iter().filter_map(move |(key, ceiling)| {
                    let value = action.param_f64(key)?;
                    (value > *ceiling).then(|| {
                        format!("action {} sets {key}={value} above {ceiling}", action.order)
                    })
                })
            })
            .collect();

        SafetyCheck {
            kind: SafetyCheckKind::ResourceLimit,
            passed: violations.is_empty(),
            details: if violations.is_empty() {
                "all parameters within platform limits".into()
            } else {
                violations.join("; ")
            },
        }
    }
}

fn rollback_available(actions: &[RemediationAction]) -> SafetyCheck {
    if all_reversible(actions) {
        return SafetyCheck {
            kind: SafetyCheckKind::RollbackAvailable,
            passed: true,
            details: "every action is reversed by re-applying the prior configuration".into(),
        };
    }

    let irreversible: Vec<String> = actions
        .iter()
        .filter(|action| !action.reversible())
        .map(|action| action.action_type.to_string())
        .collect();
    SafetyCheck {
        kind: SafetyCheckKind::RollbackAvailable,
        passed: false,
        details: format!("no reverse operation for: {}", irreversible.join(", ")),
    }
}

pub fn requires_approval(checks: &[SafetyCheck]) -> bool {
    checks.iter().any(|check| !check.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::ActionType;

    fn actions(count: u32) -> Vec<RemediationAction> {
        (1..=count)
            .map(|order| RemediationAction::new(ActionType::RestartService, order, "restart"))
            .collect()
    }

    fn check(checks: &[SafetyCheck], kind: SafetyCheckKind) -> &SafetyCheck {
        checks.iter().find(|c| c.kind == kind).expect("check present")
    }

    #[test]
    fn five_actions_pass_rate_limit_six_fail() {
        let gate = SafetyGate::default();

        let checks = gate.evaluate(&actions(5));
        assert!(check(&checks, SafetyCheckKind::RateLimit).passed);
        assert!(!requires_approval(&checks));

        let checks = gate.evaluate(&actions(6));
        assert!(!check(&checks, SafetyCheckKind::RateLimit).passed);
        assert!(requires_approval(&checks));
    }

    #[test]
    fn resource_ceiling_violation_fails_only_that_check() {
        let gate = SafetyGate::default();
        let oversized = vec![RemediationAction::new(ActionType::UpdateConfig, 1, "huge")
            .with_param("memory_mb", 20_480)
            .with_param("timeout_secs", 30)];

        let checks = gate.evaluate(&oversized);
        let resource = check(&checks, SafetyCheckKind::ResourceLimit);
        assert!(!resource.passed);
        assert!(resource.details.contains("memory_mb"));
        assert!(check(&checks, SafetyCheckKind::RateLimit).passed);
        assert!(check(&checks, SafetyCheckKind::RollbackAvailable).passed);
        assert!(requires_approval(&checks));
    }

    #[test]
    fn values_at_the_ceiling_pass() {
        let gate = SafetyGate::default();
        let at_limit = vec![RemediationAction::new(ActionType::UpdateConfig, 1, "max")
            .with_param("memory_mb", 10_240)
            .with_param("timeout_secs", 900)];
        assert!(!requires_approval(&gate.evaluate(&at_limit)));
    }

    #[test]
    fn built_in_actions_are_reversible() {
        let all_types = [
            ActionType::UpdateConfig,
            ActionType::RestartService,
            ActionType::ScaleResources,
            ActionType::Rollback,
            ActionType::Custom,
        ];
        let actions: Vec<RemediationAction> = all_types
            .iter()
            .enumerate()
            .map(|(i, t)| RemediationAction::new(*t, i as u32 + 1, "x"))
            .collect();
        let checks = SafetyGate::default().evaluate(&actions);
        assert!(check(&checks, SafetyCheckKind::RollbackAvailable).passed);
    }

    #[test]
    fn empty_plan_passes_every_check() {
        let checks = SafetyGate::default().evaluate(&[]);
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.passed));
    }
}
