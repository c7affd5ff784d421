//! Policy evaluation for mutating commands.
//!
//! Every write-shaped tool call is evaluated before execution: risk is
//! derived from the command shape, the first matching policy by priority
//! decides, numeric bounds reject or clamp, and quiet hours escalate.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::RwLock;
use tracing::debug;

use crate::condition::Condition;

/// Risk classification of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Medium,
    High,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    RequireConfirmation,
    Modify,
    LogOnly,
}

/// Daily window during which risky actions are denied or escalated.
/// The window may cross midnight (e.g. 22:00..07:00).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Inclusive numeric bounds on a command value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NumericBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericBounds {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(min) = self.min {
            v = v.max(min);
        }
        if let Some(max) = self.max {
            v = v.min(max);
        }
        v
    }
}

/// What a policy applies to. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyMatcher {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl PolicyMatcher {
    fn matches(&self, cmd: &CommandRequest) -> bool {
        if let Some(target) = &self.target {
            if target != &cmd.target {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if action != &cmd.action {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !cmd.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(area) = &self.area {
            if cmd.area.as_deref() != Some(area.as_str()) {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if cmd.tenant.as_deref() != Some(tenant.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A user-configured policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    /// Lower numbers evaluate first.
    pub priority: i32,
    #[serde(default)]
    pub matcher: PolicyMatcher,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_override: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<NumericBounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// PIN that must accompany confirmation of actions gated by this policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_pin: Option<String>,
}

/// A mutating command presented for evaluation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub tool: String,
    pub action: String,
    pub target: String,
    pub tags: Vec<String>,
    pub area: Option<String>,
    pub tenant: Option<String>,
    /// Numeric value for bounded commands (setpoints, levels).
    pub value: Option<f64>,
    /// Flat field map for rule conditions.
    pub fields: Map<String, Value>,
}

/// Evaluation verdict.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub reason: String,
    /// Value after clamping when the decision is MODIFY.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_pin: Option<String>,
}

/// Global defaults applied when no policy matches.
#[derive(Debug, Clone)]
pub struct PolicyDefaults {
    /// HIGH-risk commands require confirmation even without a policy.
    pub confirm_high_risk: bool,
    /// Global quiet hours applied to MEDIUM and HIGH risk commands.
    pub quiet_hours: Option<QuietHours>,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            confirm_high_risk: true,
            quiet_hours: None,
        }
    }
}

/// The policy engine. Policies are ordered by priority at insert time.
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    defaults: PolicyDefaults,
}

impl PolicyEngine {
    pub fn new(defaults: PolicyDefaults) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            defaults,
        }
    }

    pub fn with_policies(defaults: PolicyDefaults, mut policies: Vec<Policy>) -> Self {
        policies.sort_by_key(|p| p.priority);
        Self {
            policies: RwLock::new(policies),
            defaults,
        }
    }

    pub fn add_policy(&self, policy: Policy) {
        let mut policies = self.policies.write().expect("policy lock");
        policies.push(policy);
        policies.sort_by_key(|p| p.priority);
    }

    pub fn list_policies(&self) -> Vec<Policy> {
        self.policies.read().expect("policy lock").clone()
    }

    /// Derive risk from the command shape. Lock manipulation is HIGH,
    /// climate and database writes are MEDIUM, lighting and reads are SAFE.
    pub fn derive_risk(cmd: &CommandRequest) -> RiskLevel {
        match cmd.action.as_str() {
            "unlock" => RiskLevel::High,
            "terminate" | "drop" | "remove" => RiskLevel::High,
            "lock" => RiskLevel::Medium,
            "set_temperature" | "thermostat" => RiskLevel::Medium,
            "write" | "execute" | "import" | "migrate" => RiskLevel::Medium,
            "turn_on" | "turn_off" | "toggle" | "activate" => RiskLevel::Safe,
            _ => RiskLevel::Medium,
        }
    }

    /// Evaluate a command at the given local time.
    pub fn evaluate(&self, cmd: &CommandRequest, now: NaiveTime) -> Evaluation {
        let derived_risk = Self::derive_risk(cmd);

        let policies = self.policies.read().expect("policy lock");
        let matched = policies.iter().find(|p| {
            p.matcher.matches(cmd)
                && p.condition
                    .as_ref()
                    .map_or(true, |c| c.evaluate(&cmd.fields))
        });

        if let Some(policy) = matched {
            let risk = policy.risk_override.unwrap_or(derived_risk);
            debug!(
                "command {}/{} matched policy {} ({:?})",
                cmd.action, cmd.target, policy.id, policy.decision
            );

            // Bounds apply before the decision: out-of-range values are
            // rejected unless the policy says MODIFY, which clamps.
            if let (Some(bounds), Some(value)) = (&policy.bounds, cmd.value) {
                if !bounds.contains(value) {
                    if policy.decision == Decision::Modify {
                        return Evaluation {
                            decision: Decision::Modify,
                            risk,
                            policy_id: Some(policy.id.clone()),
                            reason: format!(
                                "value {} clamped into [{:?}, {:?}]",
                                value, bounds.min, bounds.max
                            ),
                            modified_value: Some(bounds.clamp(value)),
                            confirmation_pin: policy.confirmation_pin.clone(),
                        };
                    }
                    return Evaluation {
                        decision: Decision::Deny,
                        risk,
                        policy_id: Some(policy.id.clone()),
                        reason: format!(
                            "value {} outside bounds [{:?}, {:?}]",
                            value, bounds.min, bounds.max
                        ),
                        modified_value: None,
                        confirmation_pin: None,
                    };
                }
            }

            if let Some(quiet) = &policy.quiet_hours {
                if quiet.contains(now) && policy.decision == Decision::Allow {
                    return Evaluation {
                        decision: Decision::RequireConfirmation,
                        risk,
                        policy_id: Some(policy.id.clone()),
                        reason: "inside quiet hours".to_string(),
                        modified_value: None,
                        confirmation_pin: policy.confirmation_pin.clone(),
                    };
                }
            }

            return Evaluation {
                decision: policy.decision,
                risk,
                policy_id: Some(policy.id.clone()),
                reason: format!("policy {}", policy.name),
                modified_value: None,
                confirmation_pin: policy.confirmation_pin.clone(),
            };
        }

        // Defaults: quiet hours escalate, HIGH risk requires confirmation.
        if let Some(quiet) = &self.defaults.quiet_hours {
            if quiet.contains(now) && derived_risk >= RiskLevel::Medium {
                return Evaluation {
                    decision: Decision::RequireConfirmation,
                    risk: derived_risk,
                    policy_id: None,
                    reason: "inside quiet hours".to_string(),
                    modified_value: None,
                    confirmation_pin: None,
                };
            }
        }

        if derived_risk == RiskLevel::High && self.defaults.confirm_high_risk {
            return Evaluation {
                decision: Decision::RequireConfirmation,
                risk: derived_risk,
                policy_id: None,
                reason: "high-risk command requires confirmation".to_string(),
                modified_value: None,
                confirmation_pin: None,
            };
        }

        Evaluation {
            decision: Decision::Allow,
            risk: derived_risk,
            policy_id: None,
            reason: "no matching policy".to_string(),
            modified_value: None,
            confirmation_pin: None,
        }
    }
}

/// Convenience for tests and defaults.
pub fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
}

/// Current wall-clock time of day.
pub fn local_time_of_day() -> NaiveTime {
    let now = chrono::Local::now();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second()).expect("valid time")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(action: &str, target: &str, value: Option<f64>) -> CommandRequest {
        CommandRequest {
            tool: "home_device_command".into(),
            action: action.into(),
            target: target.into(),
            tags: vec![],
            area: None,
            tenant: None,
            value,
            fields: Map::new(),
        }
    }

    #[test]
    fn test_risk_derivation() {
        assert_eq!(
            PolicyEngine::derive_risk(&command("unlock", "door_front", None)),
            RiskLevel::High
        );
        assert_eq!(
            PolicyEngine::derive_risk(&command("set_temperature", "hvac", Some(70.0))),
            RiskLevel::Medium
        );
        assert_eq!(
            PolicyEngine::derive_risk(&command("turn_on", "light", None)),
            RiskLevel::Safe
        );
    }

    #[test]
    fn test_high_risk_requires_confirmation_by_default() {
        let engine = PolicyEngine::new(PolicyDefaults::default());
        let eval = engine.evaluate(&command("unlock", "door_front", None), time(12, 0));
        assert_eq!(eval.decision, Decision::RequireConfirmation);
        assert_eq!(eval.risk, RiskLevel::High);
    }

    #[test]
    fn test_deny_policy_matches_first_by_priority() {
        let engine = PolicyEngine::with_policies(
            PolicyDefaults::default(),
            vec![
                Policy {
                    id: "p2".into(),
                    name: "allow all".into(),
                    priority: 10,
                    matcher: PolicyMatcher::default(),
                    decision: Decision::Allow,
                    risk_override: None,
                    bounds: None,
                    quiet_hours: None,
                    condition: None,
                    confirmation_pin: None,
                },
                Policy {
                    id: "p1".into(),
                    name: "deny garage".into(),
                    priority: 1,
                    matcher: PolicyMatcher {
                        target: Some("door_garage".into()),
                        ..Default::default()
                    },
                    decision: Decision::Deny,
                    risk_override: None,
                    bounds: None,
                    quiet_hours: None,
                    condition: None,
                    confirmation_pin: None,
                },
            ],
        );

        let eval = engine.evaluate(&command("unlock", "door_garage", None), time(12, 0));
        assert_eq!(eval.decision, Decision::Deny);
        assert_eq!(eval.policy_id.as_deref(), Some("p1"));

        let eval = engine.evaluate(&command("unlock", "door_front", None), time(12, 0));
        assert_eq!(eval.decision, Decision::Allow);
        assert_eq!(eval.policy_id.as_deref(), Some("p2"));
    }

    #[test]
    fn test_bounds_reject_and_clamp() {
        let bounded = |decision| Policy {
            id: "b".into(),
            name: "thermostat bounds".into(),
            priority: 0,
            matcher: PolicyMatcher {
                action: Some("set_temperature".into()),
                ..Default::default()
            },
            decision,
            risk_override: None,
            bounds: Some(NumericBounds {
                min: Some(55.0),
                max: Some(85.0),
            }),
            quiet_hours: None,
            condition: None,
            confirmation_pin: None,
        };

        let engine =
            PolicyEngine::with_policies(PolicyDefaults::default(), vec![bounded(Decision::Allow)]);
        let eval = engine.evaluate(&command("set_temperature", "hvac", Some(95.0)), time(12, 0));
        assert_eq!(eval.decision, Decision::Deny);

        let engine =
            PolicyEngine::with_policies(PolicyDefaults::default(), vec![bounded(Decision::Modify)]);
        let eval = engine.evaluate(&command("set_temperature", "hvac", Some(95.0)), time(12, 0));
        assert_eq!(eval.decision, Decision::Modify);
        assert_eq!(eval.modified_value, Some(85.0));

        let engine =
            PolicyEngine::with_policies(PolicyDefaults::default(), vec![bounded(Decision::Allow)]);
        let eval = engine.evaluate(&command("set_temperature", "hvac", Some(72.0)), time(12, 0));
        assert_eq!(eval.decision, Decision::Allow);
    }

    #[test]
    fn test_quiet_hours_crossing_midnight() {
        let quiet = QuietHours {
            start: time(22, 0),
            end: time(7, 0),
        };
        assert!(quiet.contains(time(23, 30)));
        assert!(quiet.contains(time(2, 0)));
        assert!(!quiet.contains(time(12, 0)));

        let engine = PolicyEngine::new(PolicyDefaults {
            confirm_high_risk: false,
            quiet_hours: Some(quiet),
        });
        let eval = engine.evaluate(&command("set_temperature", "hvac", Some(70.0)), time(23, 0));
        assert_eq!(eval.decision, Decision::RequireConfirmation);

        let eval = engine.evaluate(&command("turn_on", "light", None), time(23, 0));
        assert_eq!(eval.decision, Decision::Allow);
    }

    #[test]
    fn test_condition_gates_match() {
        use crate::condition::{Comparator, Condition};

        let engine = PolicyEngine::with_policies(
            PolicyDefaults {
                confirm_high_risk: false,
                quiet_hours: None,
            },
            vec![Policy {
                id: "cond".into(),
                name: "deny hot setpoints".into(),
                priority: 0,
                matcher: PolicyMatcher::default(),
                decision: Decision::Deny,
                risk_override: None,
                bounds: None,
                quiet_hours: None,
                condition: Some(Condition::Cmp {
                    field: "value".into(),
                    cmp: Comparator::Gt,
                    value: serde_json::json!(90),
                }),
                confirmation_pin: None,
            }],
        );

        let mut cmd = command("set_temperature", "hvac", Some(95.0));
        cmd.fields
            .insert("value".into(), serde_json::json!(95));
        assert_eq!(engine.evaluate(&cmd, time(12, 0)).decision, Decision::Deny);

        let mut cmd = command("set_temperature", "hvac", Some(72.0));
        cmd.fields
            .insert("value".into(), serde_json::json!(72));
        assert_eq!(engine.evaluate(&cmd, time(12, 0)).decision, Decision::Allow);
    }
}
