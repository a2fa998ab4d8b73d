use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, info};

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::guard::{CompareOp, FieldRef, Guard};
use swarmflow_core::spec::{Constraint, JoinCondition, Pattern, Phase, WorkflowSpec};
use swarmflow_core::state::CURRENT_SCHEMA_VERSION;

use crate::edge::Edge;
use crate::graph::CompiledGraph;
use crate::schema::StateSchema;
use crate::step::{Step, StepKind, TERMINAL_ID};

/// Tag mixed into every graph id; bump when lowering rules change.
pub const COMPILER_VERSION: &str = "swarmflow-graph/2";

/// A lowered phase: where control enters and the guarded ways out.
struct Fragment {
    entry: String,
    exits: Vec<(String, Guard)>,
}

/// Compiles workflow specs into graphs.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Validate `spec` and lower it into a checked graph.
    pub fn compile(spec: &WorkflowSpec) -> Result<CompiledGraph> {
        spec.validate()?;

        let mut assembly = Assembly::new(spec)?;
        assembly.emit_fallbacks();

        let mut fragments = Vec::with_capacity(spec.phases.len());
        for phase in &spec.phases {
            fragments.push(assembly.lower_phase(phase)?);
        }
        let entry = assembly.link(fragments, TERMINAL_ID.to_string());
        assembly.steps.push(Step::terminal());

        let id = graph_id(spec)?;
        let schema = assembly.schema();
        let Assembly { steps, edges, .. } = assembly;
        debug!(steps = steps.len(), edges = edges.len(), "Lowered workflow spec");

        let graph = CompiledGraph::assemble(
            id,
            spec.revision,
            spec.name.clone(),
            entry,
            steps,
            edges,
            CURRENT_SCHEMA_VERSION,
            schema,
        )?;
        info!(
            graph_id = %graph.short_id(),
            name = %graph.name,
            revision = graph.revision,
            steps = graph.steps.len(),
            "Compiled workflow graph"
        );
        Ok(graph)
    }
}

/// Content hash of the workflow spec plus the compiler tag.
pub fn graph_id(spec: &WorkflowSpec) -> Result<String> {
    let body = serde_json::to_vec(spec)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(COMPILER_VERSION.as_bytes());
    hasher.update(&[0]);
    hasher.update(&body);
    Ok(hasher.finalize().to_hex().to_string())
}

struct Assembly<'a> {
    spec: &'a WorkflowSpec,
    steps: Vec<Step>,
    edges: Vec<Edge>,
    /// participant → eligibility guard from its constraints.
    eligibility: BTreeMap<&'a str, Guard>,
    /// participants preceded by an interrupt gate.
    gated: BTreeSet<&'a str>,
}

impl<'a> Assembly<'a> {
    fn new(spec: &'a WorkflowSpec) -> Result<Self> {
        let mut eligibility: BTreeMap<&str, Vec<Guard>> = BTreeMap::new();
        let mut gated = BTreeSet::new();
        for constraint in &spec.constraints {
            match constraint {
                Constraint::DependsOn { participant, tasks } => eligibility
                    .entry(participant.as_str())
                    .or_default()
                    .push(Guard::all_progress(tasks.clone(), 100.0)),
                Constraint::Condition { participant, expr } => eligibility
                    .entry(participant.as_str())
                    .or_default()
                    .push(Guard::parse(expr)?),
                Constraint::RequireApproval { participant } => {
                    gated.insert(participant.as_str());
                }
                Constraint::OnDenied { .. } => {}
            }
        }
        Ok(Self {
            spec,
            steps: Vec::new(),
            edges: Vec::new(),
            eligibility: eligibility
                .into_iter()
                .map(|(p, guards)| (p, Guard::and(guards)))
                .collect(),
            gated,
        })
    }

    fn eligible(&self, participant: &str) -> Guard {
        self.eligibility
            .get(participant)
            .cloned()
            .unwrap_or(Guard::Always)
    }

    /// Step id that edges into `participant` must target.
    fn inbound(&self, participant: &str) -> String {
        if self.gated.contains(participant) {
            gate_id(participant)
        } else {
            participant.to_string()
        }
    }

    fn edge(&mut self, from: impl Into<String>, to: impl Into<String>, guard: Guard) {
        self.edges.push(Edge::guarded(from, to, guard));
    }

    /// Denial fallbacks go first so they win over a participant's other
    /// out-edges.
    fn emit_fallbacks(&mut self) {
        let fallbacks: Vec<(String, String)> = self
            .spec
            .constraints
            .iter()
            .filter_map(|c| match c {
                Constraint::OnDenied {
                    participant,
                    fallback,
                } => Some((participant.clone(), self.inbound(fallback))),
                _ => None,
            })
            .collect();
        for (participant, target) in fallbacks {
            self.edge(participant, target, Guard::OnDenied);
        }
    }

    fn add_participant(&mut self, id: &str, phase: &Phase) {
        let Some(participant) = self.spec.participant(id) else {
            return;
        };
        if self.gated.contains(id) {
            let gate = gate_id(id);
            self.steps.push(
                Step::new(&gate, StepKind::InterruptGate)
                    .for_participant(id)
                    .in_phase(&phase.id),
            );
            self.edge(gate, id, Guard::Always);
        }
        let mut step = Step::new(id, StepKind::Agent)
            .for_participant(id)
            .in_phase(&phase.id);
        step.task = Some(participant.task_key().to_string());
        step.retry = participant.retry.clone();
        self.steps.push(step);
    }

    fn lower_phase(&mut self, phase: &Phase) -> Result<Fragment> {
        match &phase.pattern {
            Pattern::Sequential => Ok(self.lower_sequential(phase)),
            Pattern::Parallel => Ok(self.lower_concurrent(phase, StepKind::Aggregator, "join", true)),
            Pattern::Supervisor => Ok(self.lower_supervisor(phase)),
            Pattern::Consensus { rule } => {
                let mut fragment =
                    self.lower_concurrent(phase, StepKind::Voting { rule: *rule }, "vote", false);
                // A rejected vote matches no exit, so the run stops at the vote.
                for (vote, guard) in fragment.exits.iter_mut() {
                    *guard = approved(vote);
                }
                Ok(fragment)
            }
            Pattern::Competitive { scoring } => Ok(self.lower_concurrent(
                phase,
                StepKind::Evaluator {
                    scoring: scoring.clone(),
                },
                "judge",
                false,
            )),
            Pattern::Hybrid { phases } => {
                let mut nested = Vec::with_capacity(phases.len());
                for inner in phases {
                    nested.push(self.lower_phase(inner)?);
                }
                let mut iter = nested.into_iter();
                let first = iter
                    .next()
                    .ok_or_else(|| SwarmError::SpecValidation(format!("hybrid phase '{}' is empty", phase.id)))?;
                let entry = first.entry.clone();
                let mut exits = first.exits;
                for fragment in iter {
                    for (from, guard) in exits {
                        self.edge(from, fragment.entry.clone(), guard);
                    }
                    exits = fragment.exits;
                }
                Ok(Fragment { entry, exits })
            }
        }
    }

    /// Chain in declaration order. From each position, conditional
    /// participants get guarded edges in order; the first unconditional one
    /// (or the phase exit) takes the remaining case.
    fn lower_sequential(&mut self, phase: &Phase) -> Fragment {
        for id in &phase.participants {
            self.add_participant(id, phase);
        }
        let members = &phase.participants;

        let mut exits = Vec::new();
        let entry = if matches!(self.eligible(&members[0]), Guard::Always) {
            self.inbound(&members[0])
        } else {
            let router = control_id(&phase.id, "entry");
            self.steps.push(
                Step::new(&router, StepKind::Router)
                    .in_phase(&phase.id)
                    .with_members(members.clone()),
            );
            exits.extend(self.chain_from(&router, members));
            router
        };

        for (i, id) in members.iter().enumerate() {
            exits.extend(self.chain_from(id, &members[i + 1..]));
        }
        Fragment { entry, exits }
    }

    fn chain_from(&mut self, from: &str, rest: &[String]) -> Vec<(String, Guard)> {
        for candidate in rest {
            let guard = self.eligible(candidate);
            let unconditional = matches!(guard, Guard::Always);
            let target = self.inbound(candidate);
            self.edge(from, target, guard);
            if unconditional {
                return Vec::new();
            }
        }
        vec![(from.to_string(), Guard::Always)]
    }

    /// Router fan-out shared by parallel, consensus and competitive phases.
    fn lower_concurrent(
        &mut self,
        phase: &Phase,
        collector: StepKind,
        suffix: &str,
        gated_join: bool,
    ) -> Fragment {
        let router = control_id(&phase.id, "router");
        let sink = control_id(&phase.id, suffix);
        let members = phase.participants.clone();

        self.steps.push(
            Step::new(&router, StepKind::Router)
                .in_phase(&phase.id)
                .with_members(members.clone()),
        );
        for id in &members {
            self.add_participant(id, phase);
        }
        self.steps.push(
            Step::new(&sink, collector)
                .in_phase(&phase.id)
                .with_members(members.clone()),
        );

        self.fan_out(&router, &members);
        // Every member is now done or ineligible.
        self.edge(router.clone(), sink.clone(), Guard::Always);

        let exit_guard = if gated_join {
            self.join_guard(phase)
        } else {
            Guard::Always
        };
        Fragment {
            entry: router,
            exits: vec![(sink, exit_guard)],
        }
    }

    fn lower_supervisor(&mut self, phase: &Phase) -> Fragment {
        let hub = control_id(&phase.id, "hub");
        let members = phase.participants.clone();
        self.steps.push(
            Step::new(&hub, StepKind::Supervisor)
                .in_phase(&phase.id)
                .with_members(members.clone()),
        );
        for id in &members {
            self.add_participant(id, phase);
        }
        self.fan_out(&hub, &members);
        let join = self.join_guard(phase);
        Fragment {
            entry: hub.clone(),
            exits: vec![(hub, join)],
        }
    }

    /// `hub → member` while the member has not run and is eligible;
    /// `member → hub` unconditionally.
    fn fan_out(&mut self, hub: &str, members: &[String]) {
        for id in members {
            let guard = Guard::and(vec![
                Guard::negate(Guard::completed(id.as_str())),
                self.eligible(id),
            ]);
            let target = self.inbound(id);
            self.edge(hub, target, guard);
        }
        for id in members {
            self.edge(id.as_str(), hub, Guard::Always);
        }
    }

    /// Every eligible member's task reached 100 (or, for `Visited`, always).
    fn join_guard(&self, phase: &Phase) -> Guard {
        if phase.join == JoinCondition::Visited {
            return Guard::Always;
        }
        let mut unconditional = Vec::new();
        let mut conditional = Vec::new();
        for id in &phase.participants {
            let task = self
                .spec
                .participant(id)
                .map(|p| p.task_key().to_string())
                .unwrap_or_else(|| id.clone());
            match self.eligible(id) {
                Guard::Always => unconditional.push(task),
                guard => conditional.push(Guard::or(vec![
                    Guard::all_progress(vec![task], 100.0),
                    Guard::negate(guard),
                ])),
            }
        }
        let mut parts = Vec::new();
        if !unconditional.is_empty() {
            unconditional.dedup();
            parts.push(Guard::all_progress(unconditional, 100.0));
        }
        parts.extend(conditional);
        Guard::and(parts)
    }

    /// Wire fragments in order and return the overall entry.
    fn link(&mut self, fragments: Vec<Fragment>, terminal: String) -> String {
        let entries: Vec<String> = fragments.iter().map(|f| f.entry.clone()).collect();
        for (i, fragment) in fragments.into_iter().enumerate() {
            let next = entries.get(i + 1).cloned().unwrap_or_else(|| terminal.clone());
            for (from, guard) in fragment.exits {
                self.edge(from, next.clone(), guard);
            }
        }
        entries.into_iter().next().unwrap_or(terminal)
    }

    fn schema(&self) -> StateSchema {
        StateSchema {
            outputs: self
                .steps
                .iter()
                .filter(|s| s.kind.writes_output())
                .map(|s| s.id.clone())
                .collect(),
            tasks: self.spec.tasks().into_iter().map(str::to_string).collect(),
            fields: self.spec.fields.clone(),
        }
    }
}

fn control_id(phase: &str, suffix: &str) -> String {
    format!("__{}__{}", phase, suffix)
}

/// `output.<vote>.approved == true`
fn approved(vote: &str) -> Guard {
    Guard::Compare {
        reference: FieldRef::Output {
            step: vote.to_string(),
            path: vec!["approved".to_string()],
        },
        op: CompareOp::Eq,
        value: Value::Bool(true),
    }
}

fn gate_id(participant: &str) -> String {
    format!("__gate__{}", participant)
}
