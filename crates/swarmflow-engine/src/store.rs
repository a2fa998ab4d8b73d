use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::patch::StatePatch;
use swarmflow_core::permission::PermissionRule;
use swarmflow_core::reducers;
use swarmflow_core::state::ExecutionState;

/// Sole mutator of a run's live state.
///
/// Every mutation holds the lock for its whole duration, so at most one
/// `apply` is in flight per run.
pub struct StateStore {
    state: Mutex<ExecutionState>,
}

impl StateStore {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Merge a patch and return the resulting state.
    pub fn apply(&self, patch: StatePatch) -> Result<ExecutionState> {
        self.apply_at(patch, Utc::now())
    }

    pub fn apply_at(&self, patch: StatePatch, now: DateTime<Utc>) -> Result<ExecutionState> {
        let mut state = self.lock()?;
        reducers::apply(&mut state, patch, now)?;
        Ok(state.clone())
    }

    pub fn snapshot(&self) -> Result<ExecutionState> {
        Ok(self.lock()?.clone())
    }

    /// Swap in a whole state (restore, rollback, migration).
    pub fn replace(&self, state: ExecutionState) -> Result<ExecutionState> {
        Ok(std::mem::replace(&mut *self.lock()?, state))
    }

    /// Run `f` with exclusive access. Used where a decision and the
    /// mutation it implies must not be separated.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut ExecutionState) -> T) -> Result<T> {
        Ok(f(&mut *self.lock()?))
    }

    /// Take one unit of quota. Returns the remaining count, or `None` when
    /// the quota is exhausted. An unseen quota starts at `limit`.
    pub fn consume_quota(&self, participant: &str, capability: &str, limit: u32) -> Result<Option<u32>> {
        self.with_lock(|state| take_quota(state, participant, capability, limit))
    }

    /// Set one matrix entry outright. Not subject to the intersection rule.
    pub fn set_permission(&self, participant: &str, capability: &str, rule: PermissionRule) -> Result<()> {
        self.with_lock(|state| state.permissions.set(participant, capability, rule))
    }

    pub(crate) fn set_cursor(&self, cursor: Option<String>) -> Result<ExecutionState> {
        let mut state = self.lock()?;
        state.control.cursor = cursor;
        Ok(state.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ExecutionState>> {
        self.state
            .lock()
            .map_err(|e| SwarmError::LockPoisoned(e.to_string()))
    }
}

pub(crate) fn take_quota(
    state: &mut ExecutionState,
    participant: &str,
    capability: &str,
    limit: u32,
) -> Option<u32> {
    let remaining = state
        .quotas
        .entry(participant.to_string())
        .or_default()
        .entry(capability.to_string())
        .or_insert(limit);
    if *remaining == 0 {
        return None;
    }
    *remaining -= 1;
    Some(*remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn apply_returns_merged_state() {
        let store = StateStore::new(ExecutionState::new());
        store.apply(StatePatch::new().with_progress("t", 75.0)).unwrap();
        let state = store.apply(StatePatch::new().with_progress("t", 60.0)).unwrap();
        assert_eq!(state.progress("t"), Some(75.0));
    }

    #[test]
    fn invalid_patch_leaves_state_untouched() {
        let store = StateStore::new(ExecutionState::new());
        let bad = StatePatch::new()
            .with_message("a", "hello")
            .with_progress("t", 140.0);
        assert!(matches!(store.apply(bad), Err(SwarmError::InvalidPatch(_))));
        assert!(store.snapshot().unwrap().messages.is_empty());
    }

    #[test]
    fn quota_counts_down_to_exhaustion() {
        let store = StateStore::new(ExecutionState::new());
        assert_eq!(store.consume_quota("p", "search", 2).unwrap(), Some(1));
        assert_eq!(store.consume_quota("p", "search", 2).unwrap(), Some(0));
        assert_eq!(store.consume_quota("p", "search", 2).unwrap(), None);
        assert_eq!(store.snapshot().unwrap().quota_remaining("p", "search"), Some(0));
    }

    #[test]
    fn concurrent_applies_are_serialized() {
        let store = Arc::new(StateStore::new(ExecutionState::new()));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        store
                            .apply(StatePatch::new().with_message(format!("t{}", i), format!("{}", j)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.snapshot().unwrap().messages.len(), 200);
    }

    #[test]
    fn replace_returns_previous() {
        let store = StateStore::new(ExecutionState::new());
        store.apply(StatePatch::new().with_progress("t", 10.0)).unwrap();
        let old = store.replace(ExecutionState::new()).unwrap();
        assert_eq!(old.progress("t"), Some(10.0));
        assert_eq!(store.snapshot().unwrap().progress("t"), None);
    }
}
