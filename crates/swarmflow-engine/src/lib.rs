//! Execution engine for compiled swarmflow graphs.
//!
//! A [`Run`] walks its graph one step at a time: dispatch, merge the patch
//! through the [`StateStore`], route, checkpoint. Between steps it honours
//! cancellation, queued hot swaps, pauses and interrupts, in that order.
//! [`WorkflowRuntime`] is the control surface over many runs.

pub mod approval;
pub mod control;
pub mod gateway;
pub mod handlers;
pub mod hotswap;
pub mod retry;
pub mod run;
pub mod runtime;
pub mod store;
pub mod trace;
pub mod trace_log;

pub use approval::ApprovalBroker;
pub use gateway::{CapabilityClient, PermissionGateway};
pub use handlers::HandlerRegistry;
pub use hotswap::HotSwapCoordinator;
pub use run::{Run, RunDeps, RunHandle, RunSettings};
pub use runtime::WorkflowRuntime;
pub use store::StateStore;
pub use trace::TraceBook;
pub use trace_log::TraceLogger;
