use std::fmt;

use serde::{Deserialize, Serialize};

use swarmflow_core::spec::{DecisionRule, ScoringRule};
use swarmflow_core::types::RetryPolicy;

/// Id of the single terminal step every graph ends in.
pub const TERMINAL_ID: &str = "__end__";

/// What a step does when dispatched. Agent steps go to a caller-supplied
/// handler; every other kind has fixed built-in behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    /// Fan-out point; does no work.
    Router,
    /// Fan-in point for a parallel phase.
    Aggregator,
    /// Halts the run until an external resume.
    InterruptGate,
    Voting { rule: DecisionRule },
    Evaluator { scoring: ScoringRule },
    Supervisor,
    Terminal,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Router => "router",
            Self::Aggregator => "aggregator",
            Self::InterruptGate => "interrupt_gate",
            Self::Voting { .. } => "voting",
            Self::Evaluator { .. } => "evaluator",
            Self::Supervisor => "supervisor",
            Self::Terminal => "terminal",
        }
    }

    /// Whether dispatching this step writes an entry under `outputs`.
    pub fn writes_output(&self) -> bool {
        matches!(
            self,
            Self::Agent | Self::Aggregator | Self::Voting { .. } | Self::Evaluator { .. } | Self::Supervisor
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A node of the compiled graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    /// Participant behind an agent step or guarded by a gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Participants a control step coordinates, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    /// Task key for agent steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Step {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            participant: None,
            phase: None,
            members: Vec::new(),
            task: None,
            retry: None,
        }
    }

    pub fn terminal() -> Self {
        Self::new(TERMINAL_ID, StepKind::Terminal)
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    pub fn for_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == StepKind::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_and_outputs() {
        assert_eq!(StepKind::InterruptGate.to_string(), "interrupt_gate");
        assert!(StepKind::Agent.writes_output());
        assert!(!StepKind::Router.writes_output());
        assert!(!StepKind::Terminal.writes_output());
    }

    #[test]
    fn terminal_step() {
        let t = Step::terminal();
        assert!(t.is_terminal());
        assert_eq!(t.id, TERMINAL_ID);
    }
}
