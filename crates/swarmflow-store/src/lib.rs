//! Checkpoint persistence.
//!
//! [`CheckpointManager`] enforces ordering and integrity on top of any
//! [`CheckpointBackend`](swarmflow_core::traits::CheckpointBackend); the
//! backends here only move bytes.

pub mod diff;
pub mod manager;
pub mod memory;
pub mod sqlite;

pub use diff::{diff_values, FieldChange};
pub use manager::{Checkpoint, CheckpointManager, CheckpointMeta, Recovered};
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;
