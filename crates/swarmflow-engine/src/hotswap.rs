//! Hot-Swap Coordinator.
//!
//! A new spec revision is queued while a run is in flight and applied at the
//! next step boundary: the state is migrated onto the new graph's schema and
//! the routing cursor is re-derived.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::migration::MigrationRegistry;
use swarmflow_core::permission::PermissionRule;
use swarmflow_core::spec::WorkflowSpec;
use swarmflow_core::state::{ArchivedField, ExecutionState};
use swarmflow_core::types::CursorRemap;
use swarmflow_graph::{CompiledGraph, TERMINAL_ID};

/// Pending revision and stale flag for one run.
pub struct HotSwapCoordinator {
    pending: Mutex<Option<WorkflowSpec>>,
    stale: AtomicBool,
    active_revision: AtomicU64,
}

impl HotSwapCoordinator {
    pub fn new(active_revision: u64) -> Self {
        Self {
            pending: Mutex::new(None),
            stale: AtomicBool::new(false),
            active_revision: AtomicU64::new(active_revision),
        }
    }

    /// Queue a revision and mark the active graph stale. A newer submission
    /// replaces an older one that has not been applied yet.
    pub fn submit(&self, spec: WorkflowSpec) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| SwarmError::LockPoisoned(e.to_string()))?;
        let floor = pending
            .as_ref()
            .map(|p| p.revision)
            .unwrap_or(0)
            .max(self.active_revision());
        if spec.revision <= floor {
            return Err(SwarmError::SpecValidation(format!(
                "revision {} is not newer than revision {}",
                spec.revision, floor
            )));
        }
        debug!(revision = spec.revision, "Hot swap queued");
        *pending = Some(spec);
        self.stale.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn take(&self) -> Option<WorkflowSpec> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn active_revision(&self) -> u64 {
        self.active_revision.load(Ordering::SeqCst)
    }

    pub fn mark_applied(&self, revision: u64) {
        self.active_revision.store(revision, Ordering::SeqCst);
        self.stale.store(false, Ordering::SeqCst);
    }

    /// Drop the stale flag after a rejected revision.
    pub fn abort(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }
}

/// State carried onto a new graph.
#[derive(Debug, Clone)]
pub struct StateMigration {
    pub state: ExecutionState,
    /// Dotted paths moved into the archive.
    pub archived: Vec<String>,
    /// Schema version before a registry migration, if one ran.
    pub schema_from: Option<u32>,
}

/// Carry, default and archive: values known to both schemas stay, new
/// fields get their declared defaults, and values that no longer belong to
/// any step move into `state.archive`.
pub fn migrate_state(
    state: ExecutionState,
    old: &CompiledGraph,
    new: &CompiledGraph,
    spec: &WorkflowSpec,
    old_revision: u64,
    registry: &MigrationRegistry,
    now: DateTime<Utc>,
) -> Result<StateMigration> {
    let mut schema_from = None;
    let mut state = if state.schema_version != new.schema_version {
        let from = state.schema_version;
        let migrated = registry.migrate(&serde_json::to_value(&state)?, new.schema_version)?;
        schema_from = Some(from);
        migrated.state
    } else {
        state
    };

    let diff = old.schema().diff(new.schema());
    let mut archived = Vec::new();
    let mut archive = |state: &mut ExecutionState, path: String, value: Value| {
        state.archive.push(ArchivedField {
            revision: old_revision,
            path: path.clone(),
            value,
            archived_at: now,
        });
        archived.push(path);
    };

    for name in &diff.added_fields {
        if let Some(default) = new.schema().fields.get(name) {
            state.fields.entry(name.clone()).or_insert_with(|| default.clone());
        }
    }
    for name in &diff.removed_fields {
        if let Some(value) = state.fields.remove(name) {
            archive(&mut state, format!("fields.{}", name), value);
        }
    }
    for step in &diff.removed_outputs {
        if let Some(record) = state.outputs.remove(step) {
            let value = serde_json::to_value(&record)?;
            archive(&mut state, format!("outputs.{}", step), value);
        }
    }
    for task in &diff.removed_tasks {
        if let Some(progress) = state.task_progress.remove(task) {
            archive(&mut state, format!("task_progress.{}", task), Value::from(progress));
        }
    }
    let vanished: Vec<String> = state
        .completed_steps
        .keys()
        .filter(|step| !new.contains(step))
        .cloned()
        .collect();
    for step in vanished {
        if let Some(count) = state.completed_steps.remove(&step) {
            archive(&mut state, format!("completed_steps.{}", step), Value::from(count));
        }
    }

    // Participants new to this revision get their declared capabilities.
    for participant in &spec.participants {
        for capability in &participant.capabilities {
            if state.permissions.get(&participant.id, capability).is_none() {
                state
                    .permissions
                    .set(participant.id.clone(), capability.clone(), PermissionRule::Allow);
            }
        }
    }

    Ok(StateMigration {
        state,
        archived,
        schema_from,
    })
}

/// Re-derive the routing cursor on `new`.
///
/// Tried in order: route from the last completed step if it survived; keep
/// the pending step if it survived; the nearest surviving ancestor of the
/// pending step in `old`; the new entry.
pub fn remap_cursor(
    old: &CompiledGraph,
    new: &CompiledGraph,
    state: &ExecutionState,
) -> (String, CursorRemap) {
    let cursor = state.control.cursor.as_deref();
    if cursor == Some(TERMINAL_ID) {
        return (TERMINAL_ID.to_string(), CursorRemap::Finished);
    }

    if let Some(last) = state.control.last_step.as_deref() {
        if new.contains(last) {
            if let Ok(Some(next)) = new.route(last, state) {
                return (next, CursorRemap::Successor { of: last.to_string() });
            }
        }
    }

    let Some(cursor) = cursor else {
        return (new.entry.clone(), CursorRemap::Entry);
    };
    if new.contains(cursor) {
        return (cursor.to_string(), CursorRemap::Unchanged);
    }
    if let Some((ancestor, distance)) = nearest_surviving_ancestor(old, new, cursor) {
        return (
            ancestor,
            CursorRemap::Ancestor {
                of: cursor.to_string(),
                distance,
            },
        );
    }
    (new.entry.clone(), CursorRemap::Entry)
}

/// Breadth-first over `old` predecessors. Within one distance, the
/// predecessor whose edge was declared first wins.
fn nearest_surviving_ancestor(
    old: &CompiledGraph,
    new: &CompiledGraph,
    start: &str,
) -> Option<(String, usize)> {
    let mut seen = BTreeSet::from([start.to_string()]);
    let mut queue = VecDeque::from([(start.to_string(), 0usize)]);
    while let Some((id, distance)) = queue.pop_front() {
        for pred in old.predecessors(&id) {
            if !seen.insert(pred.to_string()) {
                continue;
            }
            if new.contains(pred) {
                return Some((pred.to_string(), distance + 1));
            }
            queue.push_back((pred.to_string(), distance + 1));
        }
    }
    None
}

/// Log line for an applied swap.
pub(crate) fn log_applied(
    run_id: &str,
    from: &CompiledGraph,
    to: &CompiledGraph,
    remap: &CursorRemap,
    archived: usize,
) {
    info!(
        run_id,
        from_graph = %from.short_id(),
        to_graph = %to.short_id(),
        revision = to.revision,
        remap = ?remap,
        archived,
        "Hot swap applied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarmflow_core::patch::StatePatch;
    use swarmflow_core::reducers;
    use swarmflow_core::spec::{Participant, Pattern, Phase};
    use swarmflow_graph::GraphBuilder;

    fn seq_spec(ids: &[&str], revision: u64) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new("swap").with_revision(revision);
        for id in ids {
            spec = spec.with_participant(Participant::new(*id, "worker"));
        }
        spec.with_phase(Phase::new("main", Pattern::Sequential, ids))
    }

    fn after(steps: &[&str], cursor: &str) -> ExecutionState {
        let mut state = ExecutionState::new();
        for step in steps {
            let mut patch = StatePatch::new()
                .with_output(*step, json!(format!("{} done", step)))
                .with_progress(*step, 100.0);
            patch.completed_steps.push(step.to_string());
            patch.control.last_step = Some(step.to_string());
            reducers::apply(&mut state, patch, Utc::now()).unwrap();
        }
        state.control.cursor = Some(cursor.to_string());
        state
    }

    #[test]
    fn submit_requires_newer_revision() {
        let coordinator = HotSwapCoordinator::new(1);
        assert!(coordinator.submit(seq_spec(&["a"], 1)).is_err());
        assert!(!coordinator.is_stale());
        coordinator.submit(seq_spec(&["a"], 3)).unwrap();
        assert!(coordinator.submit(seq_spec(&["a"], 2)).is_err());
        assert!(coordinator.is_stale());

        let spec = coordinator.take().unwrap();
        assert_eq!(spec.revision, 3);
        coordinator.mark_applied(spec.revision);
        assert!(!coordinator.is_stale());
        assert_eq!(coordinator.active_revision(), 3);
        assert!(coordinator.take().is_none());
    }

    #[test]
    fn successor_of_last_step_in_new_graph() {
        let old = GraphBuilder::compile(&seq_spec(&["a", "b", "c"], 1)).unwrap();
        let new = GraphBuilder::compile(&seq_spec(&["a", "b", "x", "c"], 2)).unwrap();
        let state = after(&["a", "b"], "c");
        let (cursor, remap) = remap_cursor(&old, &new, &state);
        assert_eq!(cursor, "x");
        assert_eq!(remap, CursorRemap::Successor { of: "b".into() });
    }

    #[test]
    fn unchanged_ancestor_and_entry() {
        let old = GraphBuilder::compile(&seq_spec(&["a", "b", "c"], 1)).unwrap();

        // Cursor survives but last step vanished.
        let new = GraphBuilder::compile(&seq_spec(&["c"], 2)).unwrap();
        let state = after(&["a", "b"], "c");
        assert_eq!(remap_cursor(&old, &new, &state), ("c".into(), CursorRemap::Unchanged));

        // Neither survives; nearest ancestor of c in the old graph is b, then a.
        let new = GraphBuilder::compile(&seq_spec(&["a", "z"], 2)).unwrap();
        let mut state = after(&["b"], "c");
        state.control.last_step = Some("b".into());
        let (cursor, remap) = remap_cursor(&old, &new, &state);
        assert_eq!(cursor, "a");
        assert_eq!(
            remap,
            CursorRemap::Ancestor {
                of: "c".into(),
                distance: 2
            }
        );

        let new = GraphBuilder::compile(&seq_spec(&["q"], 2)).unwrap();
        let (cursor, remap) = remap_cursor(&old, &new, &state);
        assert_eq!(cursor, "q");
        assert_eq!(remap, CursorRemap::Entry);

        let state = after(&["a", "b", "c"], TERMINAL_ID);
        assert_eq!(remap_cursor(&old, &new, &state).1, CursorRemap::Finished);
    }

    #[test]
    fn migration_carries_defaults_and_archives() {
        let old_spec = seq_spec(&["a", "b"], 1).with_field("keep", json!(1)).with_field("drop", json!(2));
        let mut new_spec = seq_spec(&["a", "c"], 2)
            .with_field("keep", json!(10))
            .with_field("fresh", json!("x"));
        new_spec.participants[1].capabilities.push("search".into());
        let old = GraphBuilder::compile(&old_spec).unwrap();
        let new = GraphBuilder::compile(&new_spec).unwrap();

        let mut state = after(&["a", "b"], TERMINAL_ID);
        state.fields = old_spec.fields.clone();
        let messages_before = state.messages.clone();

        let out = migrate_state(
            state,
            &old,
            &new,
            &new_spec,
            1,
            &MigrationRegistry::default(),
            Utc::now(),
        )
        .unwrap();
        let s = &out.state;
        assert_eq!(s.fields["keep"], json!(1));
        assert_eq!(s.fields["fresh"], json!("x"));
        assert!(!s.fields.contains_key("drop"));
        assert!(s.outputs.contains_key("a"));
        assert!(!s.outputs.contains_key("b"));
        assert!(!s.task_progress.contains_key("b"));
        assert!(!s.completed_steps.contains_key("b"));
        assert_eq!(s.messages, messages_before);
        assert_eq!(s.permissions.get("c", "search"), Some(&PermissionRule::Allow));
        assert_eq!(out.schema_from, None);

        let mut paths = out.archived.clone();
        paths.sort();
        assert_eq!(
            paths,
            vec!["completed_steps.b", "fields.drop", "outputs.b", "task_progress.b"]
        );
        assert!(s.archive.iter().all(|a| a.revision == 1));
        let drop = s.archive.iter().find(|a| a.path == "fields.drop").unwrap();
        assert_eq!(drop.value, json!(2));
    }
}
