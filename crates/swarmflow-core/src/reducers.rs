//! Field merge rules for [`ExecutionState`].
//!
//! Every section of a [`StatePatch`] has its own rule:
//!
//! | section | rule |
//! |---|---|
//! | messages | append, order preserved, duplicate ids dropped |
//! | outputs | replace, prior value pushed to history |
//! | task progress | max wins |
//! | permissions | grant-set intersection, empty set revokes |
//! | quotas | min wins |
//! | capability calls | pending by id, results aggregated per capability |
//! | help requests | open request with same sender+topic updated in place |
//! | control flags | last write wins by timestamp |
//! | fields | replace per key |
//! | errors | append, exact duplicates dropped |

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::patch::{ControlPatch, StatePatch};
use crate::permission::{PermissionMatrix, PermissionRule};
use crate::state::{
    CapabilityCall, CapabilityCalls, CapabilityCompletion, CapabilityResult, ControlState,
    ExecutionState, HelpRequest, HelpStatus, Lww, Message, OutputRecord,
};

/// Merge a patch into the state. The patch is validated first; on error
/// the state is untouched.
pub fn apply(state: &mut ExecutionState, patch: StatePatch, now: DateTime<Utc>) -> Result<()> {
    patch.validate()?;

    append_messages(&mut state.messages, patch.messages);
    merge_outputs(&mut state.outputs, patch.outputs, now);
    merge_progress(&mut state.task_progress, patch.task_progress);
    merge_permission_grants(&mut state.permissions, patch.permissions);
    merge_quotas(&mut state.quotas, patch.quotas);
    merge_capability_calls(
        &mut state.capability_calls,
        patch.capability_requests,
        patch.capability_results,
        now,
    );
    merge_help_requests(&mut state.help_requests, patch.help_requests);
    merge_control(&mut state.control, patch.control);
    for step in patch.completed_steps {
        *state.completed_steps.entry(step).or_insert(0) += 1;
    }
    state.fields.extend(patch.fields);
    merge_errors(&mut state.errors, patch.errors);
    Ok(())
}

pub fn append_messages(log: &mut Vec<Message>, incoming: Vec<Message>) {
    for message in incoming {
        if !log.iter().any(|m| m.id == message.id) {
            log.push(message);
        }
    }
}

pub fn merge_outputs(
    outputs: &mut BTreeMap<String, OutputRecord>,
    incoming: BTreeMap<String, Value>,
    now: DateTime<Utc>,
) {
    for (step, value) in incoming {
        match outputs.get_mut(&step) {
            Some(record) => {
                let prior = std::mem::replace(&mut record.current, value);
                record.history.push(prior);
                record.updated_at = now;
            }
            None => {
                outputs.insert(step, OutputRecord::new(value, now));
            }
        }
    }
}

/// Progress never regresses.
pub fn aggregate_progress(existing: f64, incoming: f64) -> f64 {
    existing.max(incoming)
}

pub fn merge_progress(progress: &mut BTreeMap<String, f64>, incoming: BTreeMap<String, f64>) {
    for (task, value) in incoming {
        progress
            .entry(task)
            .and_modify(|p| *p = aggregate_progress(*p, value))
            .or_insert(value);
    }
}

/// Most-restrictive-wins merge of two grant sets.
pub fn resolve_permissions(existing: &BTreeSet<String>, incoming: &BTreeSet<String>) -> BTreeSet<String> {
    existing.intersection(incoming).cloned().collect()
}

/// Apply grant sets to the matrix.
///
/// A participant the matrix does not know yet is granted exactly the set.
/// Otherwise every capability outside the set is denied and capabilities in
/// the set keep their current rule; nothing new is granted.
pub fn merge_permission_grants(
    matrix: &mut PermissionMatrix,
    incoming: BTreeMap<String, BTreeSet<String>>,
) {
    for (participant, grants) in incoming {
        if !matrix.contains_participant(&participant) {
            matrix.0.entry(participant.clone()).or_default();
            for capability in grants {
                matrix.set(participant.clone(), capability, PermissionRule::Allow);
            }
            continue;
        }
        if grants.is_empty() {
            matrix.revoke_all(&participant);
            continue;
        }
        let keep = resolve_permissions(&matrix.granted(&participant), &grants);
        if let Some(caps) = matrix.0.get_mut(&participant) {
            for (capability, rule) in caps.iter_mut() {
                if !keep.contains(capability) {
                    *rule = PermissionRule::Deny;
                }
            }
        }
    }
}

/// Remaining quota only ever shrinks through a merge.
pub fn merge_quotas(
    quotas: &mut BTreeMap<String, BTreeMap<String, u32>>,
    incoming: BTreeMap<String, BTreeMap<String, u32>>,
) {
    for (participant, caps) in incoming {
        let entry = quotas.entry(participant).or_default();
        for (capability, remaining) in caps {
            entry
                .entry(capability)
                .and_modify(|r| *r = (*r).min(remaining))
                .or_insert(remaining);
        }
    }
}

pub fn merge_capability_calls(
    calls: &mut CapabilityCalls,
    requests: Vec<CapabilityCall>,
    results: Vec<CapabilityCompletion>,
    now: DateTime<Utc>,
) {
    for request in requests {
        calls.pending.insert(request.id.clone(), request);
    }
    for completion in results {
        if let Some(id) = &completion.call_id {
            calls.pending.remove(id);
        }
        match calls.completed.get_mut(&completion.capability) {
            Some(entry) => {
                let prior = std::mem::replace(&mut entry.latest, completion.result);
                entry.history.push(prior);
                entry.execution_count += 1;
                entry.last_executed = now;
            }
            None => {
                calls.completed.insert(
                    completion.capability,
                    CapabilityResult {
                        latest: completion.result,
                        history: Vec::new(),
                        execution_count: 1,
                        last_executed: now,
                    },
                );
            }
        }
    }
}

pub fn merge_help_requests(requests: &mut Vec<HelpRequest>, incoming: Vec<HelpRequest>) {
    for request in incoming {
        let open_match = requests.iter_mut().find(|r| {
            r.status == HelpStatus::Open && r.sender == request.sender && r.topic == request.topic
        });
        match open_match {
            Some(existing) => *existing = request,
            None => requests.push(request),
        }
    }
}

/// Later timestamp wins; equal timestamps resolve to the larger value so the
/// outcome does not depend on apply order.
pub fn merge_lww<T: Ord>(current: &mut Lww<T>, incoming: Lww<T>) {
    let newer = incoming.at > current.at || (incoming.at == current.at && incoming.value > current.value);
    if newer {
        *current = incoming;
    }
}

pub fn merge_control(control: &mut ControlState, incoming: ControlPatch) {
    if let Some(flag) = incoming.should_continue {
        merge_lww(&mut control.should_continue, flag);
    }
    if let Some(flag) = incoming.requires_approval {
        merge_lww(&mut control.requires_approval, flag);
    }
    if let Some(flag) = incoming.interrupt {
        merge_lww(&mut control.interrupt, flag);
    }
    if incoming.cursor.is_some() {
        control.cursor = incoming.cursor;
    }
    if incoming.last_step.is_some() {
        control.last_step = incoming.last_step;
    }
    if incoming.last_outcome.is_some() {
        control.last_outcome = incoming.last_outcome;
    }
}

pub fn merge_errors(errors: &mut Vec<String>, incoming: Vec<String>) {
    for error in incoming {
        if !errors.contains(&error) {
            errors.push(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn progress_is_max_wins() {
        assert_eq!(aggregate_progress(75.0, 60.0), 75.0);
        assert_eq!(aggregate_progress(60.0, 75.0), 75.0);

        let mut progress = BTreeMap::new();
        merge_progress(&mut progress, BTreeMap::from([("a".to_string(), 75.0)]));
        merge_progress(&mut progress, BTreeMap::from([("a".to_string(), 60.0)]));
        assert_eq!(progress["a"], 75.0);
    }

    #[test]
    fn permission_resolve_is_intersection() {
        let resolved = resolve_permissions(&set(&["t1", "t2", "t3"]), &set(&["t2", "t3", "t4"]));
        assert_eq!(resolved, set(&["t2", "t3"]));
    }

    #[test]
    fn permission_grants_never_widen() {
        let mut matrix = PermissionMatrix::new();
        merge_permission_grants(
            &mut matrix,
            BTreeMap::from([("qa".to_string(), set(&["t1", "t2", "t3"]))]),
        );
        assert_eq!(matrix.granted("qa"), set(&["t1", "t2", "t3"]));

        merge_permission_grants(
            &mut matrix,
            BTreeMap::from([("qa".to_string(), set(&["t2", "t3", "t4"]))]),
        );
        assert_eq!(matrix.granted("qa"), set(&["t2", "t3"]));
        assert_eq!(matrix.get("qa", "t1"), Some(&PermissionRule::Deny));
        assert!(matrix.get("qa", "t4").is_none());

        merge_permission_grants(&mut matrix, BTreeMap::from([("qa".to_string(), BTreeSet::new())]));
        assert!(matrix.granted("qa").is_empty());
    }

    #[test]
    fn outputs_keep_full_history() {
        let mut outputs = BTreeMap::new();
        for i in 0..15 {
            merge_outputs(&mut outputs, BTreeMap::from([("w".to_string(), json!(i))]), t(i));
        }
        let record = &outputs["w"];
        assert_eq!(record.current, json!(14));
        assert_eq!(record.history.len(), 14);
        assert_eq!(record.history[0], json!(0));
        assert_eq!(record.updated_at, t(14));
    }

    #[test]
    fn messages_append_in_order_without_duplicates() {
        let a = Message::new("a", "one").with_id("m1");
        let b = Message::new("b", "two").with_id("m2");
        let mut log = vec![a.clone()];
        append_messages(&mut log, vec![b.clone(), a.clone()]);
        assert_eq!(log, vec![a, b]);
    }

    #[test]
    fn help_requests_update_open_duplicates() {
        let mut requests = Vec::new();
        merge_help_requests(&mut requests, vec![HelpRequest::open("qa", "schema", "first")]);
        merge_help_requests(&mut requests, vec![HelpRequest::open("qa", "schema", "second")]);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].details, "second");

        requests[0].status = HelpStatus::Resolved;
        merge_help_requests(&mut requests, vec![HelpRequest::open("qa", "schema", "third")]);
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn capability_results_count_executions() {
        let mut calls = CapabilityCalls::default();
        let request = CapabilityCall {
            id: "c1".into(),
            participant: "qa".into(),
            capability: "search".into(),
            params: json!({}),
            requested_at: t(0),
        };
        merge_capability_calls(&mut calls, vec![request], Vec::new(), t(0));
        assert!(calls.pending.contains_key("c1"));

        let done = |id: Option<&str>, v: i64| CapabilityCompletion {
            call_id: id.map(str::to_string),
            capability: "search".into(),
            result: json!(v),
        };
        merge_capability_calls(&mut calls, Vec::new(), vec![done(Some("c1"), 1)], t(1));
        merge_capability_calls(&mut calls, Vec::new(), vec![done(None, 2)], t(2));
        assert!(calls.pending.is_empty());
        let result = &calls.completed["search"];
        assert_eq!(result.execution_count, 2);
        assert_eq!(result.latest, json!(2));
        assert_eq!(result.history, vec![json!(1)]);
    }

    #[test]
    fn lww_is_order_insensitive() {
        let older = Lww::new(true, t(1));
        let newer = Lww::new(false, t(2));

        let mut x = Lww::new(false, t(0));
        merge_lww(&mut x, older.clone());
        merge_lww(&mut x, newer.clone());

        let mut y = Lww::new(false, t(0));
        merge_lww(&mut y, newer);
        merge_lww(&mut y, older);
        assert_eq!(x, y);
        assert!(!x.value);

        let mut tie_a = Lww::new(false, t(5));
        merge_lww(&mut tie_a, Lww::new(true, t(5)));
        let mut tie_b = Lww::new(true, t(5));
        merge_lww(&mut tie_b, Lww::new(false, t(5)));
        assert_eq!(tie_a, tie_b);
    }

    #[test]
    fn apply_rejects_invalid_patch_without_mutation() {
        let mut state = ExecutionState::new();
        let before = state.clone();
        let patch = StatePatch::new()
            .with_output("w", json!(1))
            .with_progress("w", 150.0);
        assert!(apply(&mut state, patch, t(0)).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn quotas_merge_min() {
        let mut quotas = BTreeMap::new();
        let q = |n: u32| BTreeMap::from([("qa".to_string(), BTreeMap::from([("s".to_string(), n)]))]);
        merge_quotas(&mut quotas, q(5));
        merge_quotas(&mut quotas, q(7));
        merge_quotas(&mut quotas, q(3));
        assert_eq!(quotas["qa"]["s"], 3);
    }
}
