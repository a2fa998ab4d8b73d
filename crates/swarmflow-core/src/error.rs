use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    // Workflow spec and compilation errors
    #[error("Invalid workflow spec: {0}")]
    SpecValidation(String),

    #[error("Graph validation failed{}{}: {reason}", node_suffix(.node), edge_suffix(.edge))]
    GraphValidation {
        node: Option<String>,
        edge: Option<(String, String)>,
        reason: String,
    },

    // Execution errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("No handler registered for step: {0}")]
    HandlerMissing(String),

    #[error("No outgoing edge matched from step: {0}")]
    NoRoute(String),

    #[error("Step {step} visited more than {limit} times")]
    VisitLimitExceeded { step: String, limit: usize },

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled")]
    Cancelled,

    // State errors
    #[error("Invalid state patch: {0}")]
    InvalidPatch(String),

    #[error("State schema mismatch: found v{found}, expected v{expected}")]
    StateSchemaMismatch { found: u32, expected: u32 },

    #[error("State migration failed: {0}")]
    Migration(String),

    #[error("State lock poisoned: {0}")]
    LockPoisoned(String),

    // Permission errors
    #[error("Permission denied: {participant} may not invoke {capability}")]
    PermissionDenied {
        participant: String,
        capability: String,
    },

    #[error("Approval timeout for capability: {capability}")]
    ApprovalTimeout { capability: String },

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    // Checkpoint errors
    #[error("Checkpoint corrupted: run {run_id} #{sequence}: {reason}")]
    CheckpointCorruption {
        run_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("Checkpoint sequence gap for run {run_id}: expected #{expected}, got #{got}")]
    CheckpointGap {
        run_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Checkpoint not found: run {run_id} #{sequence}")]
    CheckpointNotFound { run_id: String, sequence: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn node_suffix(node: &Option<String>) -> String {
    node.as_ref()
        .map(|n| format!(" at node '{}'", n))
        .unwrap_or_default()
}

fn edge_suffix(edge: &Option<(String, String)>) -> String {
    edge.as_ref()
        .map(|(from, to)| format!(" on edge '{}' -> '{}'", from, to))
        .unwrap_or_default()
}

impl SwarmError {
    /// Build a graph validation error pointing at a node.
    pub fn at_node(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GraphValidation {
            node: Some(node.into()),
            edge: None,
            reason: reason.into(),
        }
    }

    /// Build a graph validation error pointing at an edge.
    pub fn at_edge(
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::GraphValidation {
            node: None,
            edge: Some((from.into(), to.into())),
            reason: reason.into(),
        }
    }

    /// Whether a step failure with this error may be retried.
    ///
    /// Permission outcomes and cancellation are never retried; they are
    /// decisions, not transient faults.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::ApprovalTimeout { .. }
                | Self::Cancelled
                | Self::HandlerMissing(_)
                | Self::LockPoisoned(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_validation_message_names_node() {
        let err = SwarmError::at_node("writer", "unreachable from entry");
        assert_eq!(
            err.to_string(),
            "Graph validation failed at node 'writer': unreachable from entry"
        );
    }

    #[test]
    fn graph_validation_message_names_edge() {
        let err = SwarmError::at_edge("a", "ghost", "unknown target");
        assert_eq!(
            err.to_string(),
            "Graph validation failed on edge 'a' -> 'ghost': unknown target"
        );
    }

    #[test]
    fn permission_outcomes_are_not_retryable() {
        let denied = SwarmError::PermissionDenied {
            participant: "qa".into(),
            capability: "deploy".into(),
        };
        assert!(!denied.is_retryable());
        assert!(SwarmError::StepExecution {
            step: "a".into(),
            message: "flaky".into()
        }
        .is_retryable());
    }
}
