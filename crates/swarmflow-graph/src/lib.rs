//! Graph Builder: turns a [`WorkflowSpec`](swarmflow_core::WorkflowSpec) into
//! an immutable [`CompiledGraph`] of steps and guarded edges.
//!
//! Each phase is lowered to a fragment with one entry and a list of guarded
//! exits; fragments are linked in declaration order and the last one feeds the
//! terminal step. Routing walks a step's out-edges in declaration order and
//! takes the first whose guard holds.

pub mod builder;
pub mod edge;
pub mod graph;
pub mod schema;
pub mod step;

pub use builder::{GraphBuilder, COMPILER_VERSION};
pub use edge::Edge;
pub use graph::CompiledGraph;
pub use schema::{SchemaDiff, StateSchema};
pub use step::{Step, StepKind, TERMINAL_ID};
