use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::guard::Guard;
use crate::types::RetryPolicy;

/// Prefix reserved for generated step ids.
pub const RESERVED_PREFIX: &str = "__";

/// Structured workflow description. Immutable once submitted; edits produce
/// a new value with a higher `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default = "default_revision")]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub participants: Vec<Participant>,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Declared state fields and their defaults.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

fn default_revision() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub role: String,
    /// Task key this participant reports progress under. Defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            task: None,
            capabilities: Vec::new(),
            retry: None,
        }
    }

    pub fn task_key(&self) -> &str {
        self.task.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub pattern: Pattern,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub join: JoinCondition,
}

impl Phase {
    pub fn new(id: impl Into<String>, pattern: Pattern, participants: &[&str]) -> Self {
        Self {
            id: id.into(),
            pattern,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            join: JoinCondition::default(),
        }
    }
}

/// When a concurrent phase may hand over to the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinCondition {
    /// Every participant's task reached 100.
    #[default]
    Progress,
    /// Every participant ran or was skipped.
    Visited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    Sequential,
    Parallel,
    Supervisor,
    Consensus {
        #[serde(default)]
        rule: DecisionRule,
    },
    Competitive {
        #[serde(default)]
        scoring: ScoringRule,
    },
    Hybrid { phases: Vec<Phase> },
}

impl Pattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Supervisor => "supervisor",
            Self::Consensus { .. } => "consensus",
            Self::Competitive { .. } => "competitive",
            Self::Hybrid { .. } => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionRule {
    Unanimous,
    #[default]
    Majority,
    Quorum { count: usize },
}

impl DecisionRule {
    /// Whether `yes` approvals out of `total` voters carry the decision.
    pub fn decide(&self, yes: usize, total: usize) -> bool {
        match self {
            Self::Unanimous => total > 0 && yes == total,
            Self::Majority => yes * 2 > total,
            Self::Quorum { count } => yes >= *count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringRule {
    /// Numeric value at `field` inside each candidate's output.
    NumericField { field: String },
    /// Length of the output's text form.
    #[default]
    OutputLength,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// `participant` may only run once every listed task reached 100.
    DependsOn { participant: String, tasks: Vec<String> },
    /// `participant` runs only when `expr` holds; otherwise it is skipped.
    Condition { participant: String, expr: String },
    /// An interrupt gate precedes `participant`.
    RequireApproval { participant: String },
    /// Route to `fallback` when `participant` was denied a capability.
    OnDenied { participant: String, fallback: String },
}

impl Constraint {
    pub fn participant(&self) -> &str {
        match self {
            Self::DependsOn { participant, .. }
            | Self::Condition { participant, .. }
            | Self::RequireApproval { participant }
            | Self::OnDenied { participant, .. } => participant,
        }
    }
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 1,
            description: None,
            participants: Vec::new(),
            phases: Vec::new(),
            constraints: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, default: Value) -> Self {
        self.fields.insert(name.into(), default);
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Load from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let spec: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| SwarmError::SpecValidation(format!("{}: {}", path.display(), e)))?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(spec)
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Phases with hybrid phases expanded in place, in execution order.
    pub fn leaf_phases(&self) -> Vec<&Phase> {
        fn collect<'a>(phases: &'a [Phase], out: &mut Vec<&'a Phase>) {
            for phase in phases {
                match &phase.pattern {
                    Pattern::Hybrid { phases } => collect(phases, out),
                    _ => out.push(phase),
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.phases, &mut out);
        out
    }

    /// Every task key, in participant declaration order.
    pub fn tasks(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.participants
            .iter()
            .map(|p| p.task_key())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    pub fn constraints_for<'a>(&'a self, participant: &'a str) -> impl Iterator<Item = &'a Constraint> {
        self.constraints
            .iter()
            .filter(move |c| c.participant() == participant)
    }

    /// Structural checks that need no compilation.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SwarmError::SpecValidation(msg));

        if self.name.trim().is_empty() {
            return fail("workflow name is empty".into());
        }
        if self.revision == 0 {
            return fail("revision must start at 1".into());
        }
        if self.phases.is_empty() {
            return fail("workflow has no phases".into());
        }

        let mut declared = BTreeSet::new();
        for participant in &self.participants {
            check_id("participant", &participant.id)?;
            if !declared.insert(participant.id.as_str()) {
                return fail(format!("duplicate participant '{}'", participant.id));
            }
        }
        for field in self.fields.keys() {
            check_id("field", field)?;
        }

        let mut phase_ids = BTreeSet::new();
        let mut placed: BTreeMap<&str, &str> = BTreeMap::new();
        self.validate_phases(&self.phases, &declared, &mut phase_ids, &mut placed)?;

        let tasks: BTreeSet<&str> = self.tasks().into_iter().collect();
        for constraint in &self.constraints {
            let participant = constraint.participant();
            if !declared.contains(participant) {
                return fail(format!("constraint names unknown participant '{}'", participant));
            }
            if !placed.contains_key(participant) {
                return fail(format!(
                    "constraint names participant '{}' that is in no phase",
                    participant
                ));
            }
            match constraint {
                Constraint::DependsOn { tasks: deps, .. } => {
                    if deps.is_empty() {
                        return fail(format!("dependency of '{}' lists no tasks", participant));
                    }
                    if let Some(unknown) = deps.iter().find(|t| !tasks.contains(t.as_str())) {
                        return fail(format!("'{}' depends on unknown task '{}'", participant, unknown));
                    }
                }
                Constraint::Condition { expr, .. } => {
                    Guard::parse(expr).map_err(|e| {
                        SwarmError::SpecValidation(format!("condition on '{}': {}", participant, e))
                    })?;
                }
                Constraint::OnDenied { fallback, .. } => {
                    if fallback == participant {
                        return fail(format!("'{}' cannot be its own fallback", participant));
                    }
                    if !placed.contains_key(fallback.as_str()) {
                        return fail(format!(
                            "fallback '{}' of '{}' is not a placed participant",
                            fallback, participant
                        ));
                    }
                }
                Constraint::RequireApproval { .. } => {}
            }
        }
        Ok(())
    }

    fn validate_phases<'a>(
        &'a self,
        phases: &'a [Phase],
        declared: &BTreeSet<&str>,
        phase_ids: &mut BTreeSet<&'a str>,
        placed: &mut BTreeMap<&'a str, &'a str>,
    ) -> Result<()> {
        for phase in phases {
            check_id("phase", &phase.id)?;
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(SwarmError::SpecValidation(format!("duplicate phase '{}'", phase.id)));
            }
            if let Pattern::Hybrid { phases: nested } = &phase.pattern {
                if nested.is_empty() {
                    return Err(SwarmError::SpecValidation(format!(
                        "hybrid phase '{}' has no nested phases",
                        phase.id
                    )));
                }
                if !phase.participants.is_empty() {
                    return Err(SwarmError::SpecValidation(format!(
                        "hybrid phase '{}' lists participants; place them in nested phases",
                        phase.id
                    )));
                }
                self.validate_phases(nested, declared, phase_ids, placed)?;
                continue;
            }
            if phase.participants.is_empty() {
                return Err(SwarmError::SpecValidation(format!(
                    "phase '{}' has no participants",
                    phase.id
                )));
            }
            for participant in &phase.participants {
                if !declared.contains(participant.as_str()) {
                    return Err(SwarmError::SpecValidation(format!(
                        "phase '{}' uses undeclared participant '{}'",
                        phase.id, participant
                    )));
                }
                if let Some(other) = placed.insert(participant.as_str(), phase.id.as_str()) {
                    return Err(SwarmError::SpecValidation(format!(
                        "participant '{}' appears in phases '{}' and '{}'",
                        participant, other, phase.id
                    )));
                }
            }
            if let Pattern::Consensus {
                rule: DecisionRule::Quorum { count },
            } = &phase.pattern
            {
                if *count == 0 || *count > phase.participants.len() {
                    return Err(SwarmError::SpecValidation(format!(
                        "quorum {} in phase '{}' must be within 1..={}",
                        count,
                        phase.id,
                        phase.participants.len()
                    )));
                }
            }
            if let Pattern::Competitive {
                scoring: ScoringRule::NumericField { field },
            } = &phase.pattern
            {
                if field.trim().is_empty() {
                    return Err(SwarmError::SpecValidation(format!(
                        "scoring field in phase '{}' is empty",
                        phase.id
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(SwarmError::SpecValidation(format!("{} id is empty", kind)));
    }
    if id.starts_with(RESERVED_PREFIX) {
        return Err(SwarmError::SpecValidation(format!(
            "{} id '{}' uses the reserved '{}' prefix",
            kind, id, RESERVED_PREFIX
        )));
    }
    if id.contains('.') || id.chars().any(char::is_whitespace) {
        return Err(SwarmError::SpecValidation(format!(
            "{} id '{}' may not contain dots or whitespace",
            kind, id
        )));
    }
    Ok(())
}
