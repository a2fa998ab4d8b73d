use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::permission::PermissionMatrix;
use crate::types::StepOutcome;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The single mutable object threaded through a run.
///
/// Only the state store mutates it; handlers see a read-only snapshot and
/// contribute through [`crate::StatePatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub schema_version: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputRecord>,
    #[serde(default)]
    pub task_progress: BTreeMap<String, f64>,
    #[serde(default)]
    pub permissions: PermissionMatrix,
    /// participant → capability → remaining invocations.
    #[serde(default)]
    pub quotas: BTreeMap<String, BTreeMap<String, u32>>,
    #[serde(default)]
    pub capability_calls: CapabilityCalls,
    #[serde(default)]
    pub help_requests: Vec<HelpRequest>,
    #[serde(default)]
    pub control: ControlState,
    /// step id → number of times the step completed.
    #[serde(default)]
    pub completed_steps: BTreeMap<String, u32>,
    /// Declared workflow fields.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Values displaced by hot swaps; never deleted.
    #[serde(default)]
    pub archive: Vec<ArchivedField>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            messages: Vec::new(),
            outputs: BTreeMap::new(),
            task_progress: BTreeMap::new(),
            permissions: PermissionMatrix::default(),
            quotas: BTreeMap::new(),
            capability_calls: CapabilityCalls::default(),
            help_requests: Vec::new(),
            control: ControlState::default(),
            completed_steps: BTreeMap::new(),
            fields: BTreeMap::new(),
            errors: Vec::new(),
            archive: Vec::new(),
        }
    }
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state seeded with declared field defaults.
    pub fn with_fields(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionMatrix) -> Self {
        self.permissions = permissions;
        self
    }

    /// Mean of all task progress entries, 0 when there are none.
    pub fn overall_progress(&self) -> f64 {
        if self.task_progress.is_empty() {
            return 0.0;
        }
        let total: f64 = self.task_progress.values().sum();
        total / self.task_progress.len() as f64
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step).map(|o| &o.current)
    }

    pub fn progress(&self, task: &str) -> Option<f64> {
        self.task_progress.get(task).copied()
    }

    pub fn completions(&self, step: &str) -> u32 {
        self.completed_steps.get(step).copied().unwrap_or(0)
    }

    pub fn quota_remaining(&self, participant: &str, capability: &str) -> Option<u32> {
        self.quotas
            .get(participant)
            .and_then(|caps| caps.get(capability))
            .copied()
    }

    pub fn open_help_requests(&self) -> impl Iterator<Item = &HelpRequest> {
        self.help_requests
            .iter()
            .filter(|r| r.status == HelpStatus::Open)
    }
}

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Current output of a step plus every value it replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub current: Value,
    #[serde(default)]
    pub history: Vec<Value>,
    pub updated_at: DateTime<Utc>,
}

impl OutputRecord {
    pub fn new(current: Value, at: DateTime<Utc>) -> Self {
        Self {
            current,
            history: Vec::new(),
            updated_at: at,
        }
    }
}

/// A capability call that has been requested but not yet answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    pub id: String,
    pub participant: String,
    pub capability: String,
    #[serde(default)]
    pub params: Value,
    pub requested_at: DateTime<Utc>,
}

/// Completion of a capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCompletion {
    /// Pending call this answers, if it was recorded.
    #[serde(default)]
    pub call_id: Option<String>,
    pub capability: String,
    pub result: Value,
}

/// Aggregated results per capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub latest: Value,
    #[serde(default)]
    pub history: Vec<Value>,
    pub execution_count: u64,
    pub last_executed: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCalls {
    #[serde(default)]
    pub pending: BTreeMap<String, CapabilityCall>,
    #[serde(default)]
    pub completed: BTreeMap<String, CapabilityResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpStatus {
    #[default]
    Open,
    Resolved,
}

/// A participant asking for help on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequest {
    pub sender: String,
    pub topic: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub status: HelpStatus,
    pub timestamp: DateTime<Utc>,
}

impl HelpRequest {
    pub fn open(
        sender: impl Into<String>,
        topic: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            topic: topic.into(),
            details: details.into(),
            status: HelpStatus::Open,
            timestamp: Utc::now(),
        }
    }
}

/// A single value tagged with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    pub value: T,
    pub at: DateTime<Utc>,
}

impl<T> Lww<T> {
    pub fn new(value: T, at: DateTime<Utc>) -> Self {
        Self { value, at }
    }

    pub fn now(value: T) -> Self {
        Self::new(value, Utc::now())
    }

    fn initial(value: T) -> Self {
        Self::new(value, epoch())
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Single-valued control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlFlag {
    Continue,
    Approval,
    Interrupt,
}

impl ControlFlag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Self::Continue),
            "approval" => Some(Self::Approval),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl fmt::Display for ControlFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Approval => write!(f, "approval"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Control section: flags plus the routing bookkeeping needed to recover a
/// run from a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub should_continue: Lww<bool>,
    pub requires_approval: Lww<bool>,
    pub interrupt: Lww<bool>,
    /// Next step to dispatch.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub last_step: Option<String>,
    #[serde(default)]
    pub last_outcome: Option<StepOutcome>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            should_continue: Lww::initial(true),
            requires_approval: Lww::initial(false),
            interrupt: Lww::initial(false),
            cursor: None,
            last_step: None,
            last_outcome: None,
        }
    }
}

impl ControlState {
    pub fn flag(&self, flag: ControlFlag) -> bool {
        match flag {
            ControlFlag::Continue => self.should_continue.value,
            ControlFlag::Approval => self.requires_approval.value,
            ControlFlag::Interrupt => self.interrupt.value,
        }
    }
}

/// A value moved out of the live state by a hot swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedField {
    /// Revision of the workflow spec that was replaced.
    pub revision: u64,
    /// Dotted location the value was taken from, e.g. `outputs.writer`.
    pub path: String,
    pub value: Value,
    pub archived_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_progress_is_mean() {
        let mut state = ExecutionState::new();
        assert_eq!(state.overall_progress(), 0.0);
        state.task_progress.insert("a".into(), 100.0);
        state.task_progress.insert("b".into(), 50.0);
        assert_eq!(state.overall_progress(), 75.0);
    }

    #[test]
    fn default_control_flags() {
        let control = ControlState::default();
        assert!(control.flag(ControlFlag::Continue));
        assert!(!control.flag(ControlFlag::Approval));
        assert!(!control.flag(ControlFlag::Interrupt));
        assert_eq!(control.should_continue.at.timestamp(), 0);
    }

    #[test]
    fn legacy_json_missing_sections_deserializes() {
        let json = serde_json::json!({ "schema_version": 1 });
        let state: ExecutionState = serde_json::from_value(json).unwrap();
        assert!(state.messages.is_empty());
        assert!(state.control.should_continue.value);
    }

    #[test]
    fn control_flag_parse() {
        assert_eq!(ControlFlag::parse("approval"), Some(ControlFlag::Approval));
        assert_eq!(ControlFlag::parse("nope"), None);
        assert_eq!(ControlFlag::Interrupt.to_string(), "interrupt");
    }
}
