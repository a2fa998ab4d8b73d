//! Built-in behavior of control steps.

use serde_json::{json, Map, Value};

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::patch::StatePatch;
use swarmflow_core::spec::{DecisionRule, ScoringRule};
use swarmflow_core::state::ExecutionState;
use swarmflow_graph::{CompiledGraph, Step, StepKind};

/// Dispatch a non-agent step. Routers and gates do no work.
pub fn execute(graph: &CompiledGraph, step: &Step, state: &ExecutionState) -> Result<StatePatch> {
    let patch = match &step.kind {
        StepKind::Router | StepKind::InterruptGate => StatePatch::new(),
        StepKind::Aggregator => StatePatch::new().with_output(&step.id, aggregate(graph, step, state)),
        StepKind::Supervisor => StatePatch::new().with_output(&step.id, supervise(step, state)),
        StepKind::Voting { rule } => StatePatch::new().with_output(&step.id, tally(*rule, step, state)),
        StepKind::Evaluator { scoring } => {
            StatePatch::new().with_output(&step.id, judge(scoring, step, state))
        }
        StepKind::Agent | StepKind::Terminal => {
            return Err(SwarmError::HandlerMissing(format!(
                "{} is not a control step ({})",
                step.id, step.kind
            )))
        }
    };
    Ok(patch)
}

fn aggregate(graph: &CompiledGraph, step: &Step, state: &ExecutionState) -> Value {
    let mut outputs = Map::new();
    let mut progress = Vec::new();
    for member in &step.members {
        if let Some(output) = state.output(member) {
            outputs.insert(member.clone(), output.clone());
        }
        let task = graph
            .step(member)
            .and_then(|s| s.task.as_deref())
            .unwrap_or(member);
        progress.push(state.progress(task).unwrap_or(0.0));
    }
    let mean = if progress.is_empty() {
        0.0
    } else {
        progress.iter().sum::<f64>() / progress.len() as f64
    };
    json!({
        "outputs": outputs,
        "completed": completed(step, state),
        "progress": mean,
    })
}

fn supervise(step: &Step, state: &ExecutionState) -> Value {
    let pending: Vec<&String> = step
        .members
        .iter()
        .filter(|m| state.completions(m) == 0)
        .collect();
    json!({
        "completed": completed(step, state),
        "pending": pending,
    })
}

fn completed<'a>(step: &'a Step, state: &ExecutionState) -> Vec<&'a String> {
    step.members
        .iter()
        .filter(|m| state.completions(m) > 0)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vote {
    Yes,
    No,
    Abstain,
}

/// Read a vote out of a participant's output.
///
/// Accepts a bool, a string such as `"yes"` or `"reject"`, or an object
/// with a `vote`, `approve` or `approved` key holding either.
fn read_vote(output: Option<&Value>) -> Vote {
    match output {
        Some(Value::Bool(true)) => Vote::Yes,
        Some(Value::Bool(false)) => Vote::No,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "yes" | "y" | "approve" | "approved" | "accept" | "agree" => Vote::Yes,
            "no" | "n" | "reject" | "rejected" | "deny" | "disagree" => Vote::No,
            _ => Vote::Abstain,
        },
        Some(Value::Object(map)) => ["vote", "approve", "approved"]
            .iter()
            .find_map(|k| map.get(*k))
            .map(|v| read_vote(Some(v)))
            .unwrap_or(Vote::Abstain),
        _ => Vote::Abstain,
    }
}

fn tally(rule: DecisionRule, step: &Step, state: &ExecutionState) -> Value {
    let mut votes = Map::new();
    let (mut yes, mut no, mut abstain) = (0usize, 0usize, 0usize);
    for member in &step.members {
        let vote = read_vote(state.output(member));
        match vote {
            Vote::Yes => yes += 1,
            Vote::No => no += 1,
            Vote::Abstain => abstain += 1,
        }
        let label = match vote {
            Vote::Yes => "yes",
            Vote::No => "no",
            Vote::Abstain => "abstain",
        };
        votes.insert(member.clone(), json!(label));
    }
    json!({
        "approved": rule.decide(yes, step.members.len()),
        "yes": yes,
        "no": no,
        "abstain": abstain,
        "votes": votes,
    })
}

fn score(scoring: &ScoringRule, output: &Value) -> Option<f64> {
    match scoring {
        ScoringRule::NumericField { field } => field
            .split('.')
            .try_fold(output, |v, key| v.get(key))
            .and_then(Value::as_f64),
        ScoringRule::OutputLength => Some(match output {
            Value::String(s) => s.chars().count() as f64,
            other => other.to_string().len() as f64,
        }),
    }
}

/// Highest score wins; ties go to the member declared first.
fn judge(scoring: &ScoringRule, step: &Step, state: &ExecutionState) -> Value {
    let mut scores = Map::new();
    let mut best: Option<(&String, f64)> = None;
    for member in &step.members {
        let Some(value) = state.output(member).and_then(|o| score(scoring, o)) else {
            continue;
        };
        scores.insert(member.clone(), json!(value));
        if best.map_or(true, |(_, top)| value > top) {
            best = Some((member, value));
        }
    }
    match best {
        Some((winner, top)) => json!({
            "winner": winner,
            "score": top,
            "output": state.output(winner),
            "scores": scores,
        }),
        None => json!({ "winner": null, "scores": scores }),
    }
}
