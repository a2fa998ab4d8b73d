pub mod config;
pub mod error;
pub mod event;
pub mod guard;
pub mod migration;
pub mod patch;
pub mod permission;
pub mod reducers;
pub mod spec;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, SwarmError};
pub use event::EventBus;
pub use guard::{FieldRef, Guard};
pub use patch::StatePatch;
pub use spec::WorkflowSpec;
pub use state::ExecutionState;
pub use types::*;
