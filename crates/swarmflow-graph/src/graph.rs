use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tracing::trace;

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::guard::FieldRef;
use swarmflow_core::state::ExecutionState;

use crate::edge::Edge;
use crate::schema::StateSchema;
use crate::step::Step;

/// An immutable, validated step graph.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledGraph {
    /// `blake3(compiler version ‖ spec JSON)`, hex encoded.
    pub id: String,
    /// Revision of the workflow spec this graph was built from.
    pub revision: u64,
    pub name: String,
    pub entry: String,
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
    /// State schema version the graph expects.
    pub schema_version: u32,
    pub schema: StateSchema,
    #[serde(skip)]
    index: BTreeMap<String, usize>,
}

impl CompiledGraph {
    /// Assemble and validate. Any structural violation is an error naming the
    /// offending node or edge.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        id: String,
        revision: u64,
        name: String,
        entry: String,
        steps: Vec<Step>,
        edges: Vec<Edge>,
        schema_version: u32,
        schema: StateSchema,
    ) -> Result<Self> {
        let mut index = BTreeMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(SwarmError::at_node(&step.id, "duplicate step id"));
            }
        }
        let graph = Self {
            id,
            revision,
            name,
            entry,
            steps,
            edges,
            schema_version,
            schema,
            index,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Out-edges of a step in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Distinct predecessors of a step, in edge declaration order.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .filter(|from| seen.insert(*from))
            .collect()
    }

    pub fn terminals(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_terminal())
    }

    /// The state layout this graph expects.
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Next step after `from`: the first out-edge whose guard holds.
    ///
    /// `Ok(None)` for terminal steps; `NoRoute` when a non-terminal step has
    /// no matching edge.
    pub fn route(&self, from: &str, state: &ExecutionState) -> Result<Option<String>> {
        let step = self
            .step(from)
            .ok_or_else(|| SwarmError::at_node(from, "step not in graph"))?;
        if step.is_terminal() {
            return Ok(None);
        }
        for edge in self.outgoing(from) {
            if edge.guard.evaluate(state) {
                trace!(from = %from, to = %edge.to, "Edge matched");
                return Ok(Some(edge.to.clone()));
            }
        }
        Err(SwarmError::NoRoute(from.to_string()))
    }

    /// Steps reachable from `start` following edges forward.
    pub fn reachable_from(&self, start: &str) -> BTreeSet<String> {
        self.walk(start, |g, id| g.outgoing(id).map(|e| e.to.as_str()).collect())
    }

    fn walk<F>(&self, start: &str, next: F) -> BTreeSet<String>
    where
        F: for<'g> Fn(&'g Self, &'g str) -> Vec<&'g str>,
    {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        if self.contains(start) {
            seen.insert(start.to_string());
            queue.push_back(start.to_string());
        }
        while let Some(id) = queue.pop_front() {
            for n in next(self, &id) {
                if seen.insert(n.to_string()) {
                    queue.push_back(n.to_string());
                }
            }
        }
        seen
    }

    fn validate(&self) -> Result<()> {
        if !self.contains(&self.entry) {
            return Err(SwarmError::at_node(&self.entry, "entry step does not exist"));
        }
        if self.terminals().next().is_none() {
            return Err(SwarmError::GraphValidation {
                node: None,
                edge: None,
                reason: "graph has no terminal step".into(),
            });
        }

        for edge in &self.edges {
            if !self.contains(&edge.from) {
                return Err(SwarmError::at_edge(&edge.from, &edge.to, "unknown source step"));
            }
            if !self.contains(&edge.to) {
                return Err(SwarmError::at_edge(&edge.from, &edge.to, "unknown target step"));
            }
            if self.step(&edge.from).is_some_and(Step::is_terminal) {
                return Err(SwarmError::at_edge(&edge.from, &edge.to, "terminal step has an out-edge"));
            }
            for reference in edge.guard.references() {
                if !self.knows(&reference) {
                    return Err(SwarmError::at_edge(
                        &edge.from,
                        &edge.to,
                        format!("guard references unknown state field '{}'", reference),
                    ));
                }
            }
        }

        let reachable = self.reachable_from(&self.entry);
        if let Some(step) = self.steps.iter().find(|s| !reachable.contains(&s.id)) {
            return Err(SwarmError::at_node(&step.id, "unreachable from entry"));
        }

        let mut reaches_terminal = BTreeSet::new();
        for terminal in self.terminals() {
            reaches_terminal.extend(self.walk(&terminal.id, |g, id| g.predecessors(id)));
        }
        if let Some(step) = self.steps.iter().find(|s| !reaches_terminal.contains(&s.id)) {
            return Err(SwarmError::at_node(&step.id, "no path to a terminal step"));
        }
        Ok(())
    }

    fn knows(&self, reference: &FieldRef) -> bool {
        match reference {
            FieldRef::Progress(task) => self.schema.tasks.contains(task),
            FieldRef::Output { step, .. } | FieldRef::Steps(step) => self.contains(step),
            FieldRef::Field { name, .. } => self.schema.fields.contains_key(name),
            FieldRef::Flag(_) => true,
        }
    }
}
