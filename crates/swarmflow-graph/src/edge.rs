use serde::{Deserialize, Serialize};

use swarmflow_core::guard::Guard;

/// A directed edge between two steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source step id.
    pub from: String,
    /// Target step id.
    pub to: String,
    /// Must hold for the edge to be taken.
    pub guard: Guard,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::guarded(from, to, Guard::Always)
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: Guard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard,
        }
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self.guard, Guard::Always)
    }
}
