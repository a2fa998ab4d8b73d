use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::guard::Guard;
use crate::state::{ControlFlag, ExecutionState};
use crate::types::RunId;

/// Decision from the permission gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    NeedsApproval,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::NeedsApproval => write!(f, "needs_approval"),
        }
    }
}

/// What a participant may do with one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PermissionRule {
    Allow,
    Deny,
    /// Every call needs an external approval.
    Approval,
    /// Allowed until `limit` calls have been granted.
    Quota { limit: u32 },
    /// Allowed while the condition holds, otherwise `otherwise`.
    Conditional {
        condition: Condition,
        #[serde(default = "default_otherwise")]
        otherwise: Decision,
    },
}

fn default_otherwise() -> Decision {
    Decision::Deny
}

impl PermissionRule {
    /// Whether the rule can ever grant the capability.
    pub fn grants(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

impl std::str::FromStr for PermissionRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "approval" | "require_approval" => Ok(Self::Approval),
            other => Err(format!("unknown permission rule: {}", other)),
        }
    }
}

/// Predicate for conditional permission entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// UTC hour window; wraps past midnight when `start_hour > end_hour`.
    ActiveHours { start_hour: u32, end_hour: u32 },
    FlagSet { flag: ControlFlag },
    /// Remaining quota for this participant and capability.
    QuotaRemaining { at_least: u32 },
    Guard { guard: Guard },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn evaluate(
        &self,
        state: &ExecutionState,
        participant: &str,
        capability: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self {
            Self::ActiveHours {
                start_hour,
                end_hour,
            } => {
                let hour = now.hour();
                if start_hour <= end_hour {
                    hour >= *start_hour && hour < *end_hour
                } else {
                    hour >= *start_hour || hour < *end_hour
                }
            }
            Self::FlagSet { flag } => state.control.flag(*flag),
            Self::QuotaRemaining { at_least } => state
                .quota_remaining(participant, capability)
                .map(|r| r >= *at_least)
                .unwrap_or(false),
            Self::Guard { guard } => guard.evaluate(state),
            Self::All { conditions } => conditions
                .iter()
                .all(|c| c.evaluate(state, participant, capability, now)),
            Self::Any { conditions } => conditions
                .iter()
                .any(|c| c.evaluate(state, participant, capability, now)),
        }
    }
}

/// participant → capability → rule. Unlisted pairs are denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionMatrix(pub BTreeMap<String, BTreeMap<String, PermissionRule>>);

impl PermissionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(
        mut self,
        participant: impl Into<String>,
        capability: impl Into<String>,
        rule: PermissionRule,
    ) -> Self {
        self.set(participant, capability, rule);
        self
    }

    pub fn get(&self, participant: &str, capability: &str) -> Option<&PermissionRule> {
        self.0.get(participant).and_then(|caps| caps.get(capability))
    }

    pub fn set(
        &mut self,
        participant: impl Into<String>,
        capability: impl Into<String>,
        rule: PermissionRule,
    ) {
        self.0
            .entry(participant.into())
            .or_default()
            .insert(capability.into(), rule);
    }

    pub fn contains_participant(&self, participant: &str) -> bool {
        self.0.contains_key(participant)
    }

    /// Capabilities the participant can be granted at all.
    pub fn granted(&self, participant: &str) -> BTreeSet<String> {
        self.0
            .get(participant)
            .map(|caps| {
                caps.iter()
                    .filter(|(_, rule)| rule.grants())
                    .map(|(cap, _)| cap.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deny every capability of a participant.
    pub fn revoke_all(&mut self, participant: &str) {
        if let Some(caps) = self.0.get_mut(participant) {
            for rule in caps.values_mut() {
                *rule = PermissionRule::Deny;
            }
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// A capability call waiting on an external decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub run_id: RunId,
    pub participant: String,
    pub capability: String,
    pub params_summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Decision on an approval request.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 30, 0).unwrap()
    }

    #[test]
    fn active_hours_window() {
        let state = ExecutionState::new();
        let day = Condition::ActiveHours {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(day.evaluate(&state, "p", "c", at_hour(10)));
        assert!(!day.evaluate(&state, "p", "c", at_hour(17)));

        let night = Condition::ActiveHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(night.evaluate(&state, "p", "c", at_hour(23)));
        assert!(night.evaluate(&state, "p", "c", at_hour(2)));
        assert!(!night.evaluate(&state, "p", "c", at_hour(12)));
    }

    #[test]
    fn quota_condition_reads_state() {
        let mut state = ExecutionState::new();
        let cond = Condition::QuotaRemaining { at_least: 1 };
        assert!(!cond.evaluate(&state, "p", "search", at_hour(1)));
        state
            .quotas
            .entry("p".into())
            .or_default()
            .insert("search".into(), 2);
        assert!(cond.evaluate(&state, "p", "search", at_hour(1)));
    }

    #[test]
    fn matrix_granted_excludes_denied() {
        let mut matrix = PermissionMatrix::new()
            .with_rule("qa", "read", PermissionRule::Allow)
            .with_rule("qa", "deploy", PermissionRule::Deny)
            .with_rule("qa", "search", PermissionRule::Quota { limit: 3 });
        let granted: Vec<_> = matrix.granted("qa").into_iter().collect();
        assert_eq!(granted, vec!["read".to_string(), "search".to_string()]);

        matrix.revoke_all("qa");
        assert!(matrix.granted("qa").is_empty());
        assert!(matrix.granted("ghost").is_empty());
    }

    #[test]
    fn rule_parse() {
        assert_eq!("allow".parse::<PermissionRule>().unwrap(), PermissionRule::Allow);
        assert_eq!(
            "Approval".parse::<PermissionRule>().unwrap(),
            PermissionRule::Approval
        );
        assert!("maybe".parse::<PermissionRule>().is_err());
    }

    #[test]
    fn rule_serde_shape() {
        let rule = PermissionRule::Conditional {
            condition: Condition::FlagSet {
                flag: ControlFlag::Approval,
            },
            otherwise: Decision::NeedsApproval,
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["rule"], "conditional");
        assert_eq!(json["condition"]["type"], "flag_set");
        let back: PermissionRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
