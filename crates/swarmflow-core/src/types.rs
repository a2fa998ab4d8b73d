use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::patch::StatePatch;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ready,
    Running,
    AwaitingInterrupt,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingInterrupt => "awaiting_interrupt",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of the most recently applied step, visible to guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Denied,
}

/// External resume signal for a paused or interrupted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResumeAction {
    /// Continue as-is.
    Continue,
    /// Apply the patch through the state store, then continue.
    ModifyThenContinue { patch: StatePatch },
    /// Stop the run; it ends Failed.
    Abort { reason: String },
}

impl ResumeAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::ModifyThenContinue { .. } => "modify_then_continue",
            Self::Abort { .. } => "abort",
        }
    }
}

/// Per-step retry policy with bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 5_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Un-jittered backoff for a zero-based attempt.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// How the cursor was re-derived after a hot swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CursorRemap {
    /// Routed from the last completed step inside the new graph.
    Successor { of: String },
    /// The pending step still exists.
    Unchanged,
    /// The nearest surviving ancestor of the pending step.
    Ancestor { of: String, distance: usize },
    /// Nothing could be mapped; restart at the new entry.
    Entry,
    /// The run had already reached its terminal step.
    Finished,
}

/// One entry in a run's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Position in the trace, starting at 0.
    pub index: u64,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub kind: TraceKind,
}

/// What happened at a trace position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceKind {
    RunStarted { graph_id: String, entry: String },
    StepStarted { step: String, attempt: u32 },
    StepRetried { step: String, attempt: u32, backoff_ms: u64, error: String },
    StepCompleted { step: String, outcome: StepOutcome },
    StepFailed { step: String, error: String },
    Routed { from: String, to: String },
    Checkpointed { sequence: u64 },
    PermissionDenied { participant: String, capability: String },
    ApprovalRequired { participant: String, capability: String },
    QuotaConsumed { participant: String, capability: String, remaining: u32 },
    Interrupted { step: String },
    Paused { cursor: Option<String> },
    Resumed { action: String },
    HotSwapQueued { revision: u64 },
    HotSwapApplied {
        from_graph: String,
        to_graph: String,
        cursor_before: Option<String>,
        cursor_after: Option<String>,
        remap: CursorRemap,
        archived: Vec<String>,
    },
    HotSwapAborted { revision: u64, reason: String },
    StateMigrated { from: u32, to: u32 },
    RolledBack { sequence: u64 },
    PermissionUpdated { participant: String, capability: String },
    Completed,
    Failed { reason: String },
}

impl TraceKind {
    /// The step id carried by step-scoped records.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepRetried { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. }
            | Self::Interrupted { step } => Some(step),
            _ => None,
        }
    }
}

/// Events published on the [`crate::event::EventBus`].
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A trace record was appended.
    Trace(TraceRecord),
    /// Status transition of a run.
    StatusChanged { run_id: RunId, from: RunStatus, to: RunStatus },
    /// Approval requested for a capability call.
    ApprovalRequested { request: crate::permission::ApprovalRequest },
    /// Approval resolved (approved or denied).
    ApprovalResolved { request_id: String, approved: bool },
}

impl RunEvent {
    /// Run id the event belongs to, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Trace(record) => Some(&record.run_id),
            Self::StatusChanged { run_id, .. } => Some(run_id),
            Self::ApprovalRequested { request } => Some(&request.run_id),
            Self::ApprovalResolved { .. } => None,
        }
    }
}
