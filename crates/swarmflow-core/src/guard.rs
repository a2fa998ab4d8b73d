//! Edge guard predicates.
//!
//! Guards are plain data evaluated against an [`ExecutionState`], so a
//! compiled graph can be hashed, serialized and compared.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::state::{ControlFlag, ExecutionState};
use crate::types::StepOutcome;

/// A reference to a readable location in the execution state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldRef {
    /// `progress.<task>`
    Progress(String),
    /// `output.<step>[.path]`
    Output { step: String, path: Vec<String> },
    /// `field.<name>[.path]`
    Field { name: String, path: Vec<String> },
    /// `flag.<continue|approval|interrupt>`
    Flag(ControlFlag),
    /// `steps.<step>`: completion count.
    Steps(String),
}

impl FieldRef {
    pub fn progress(task: impl Into<String>) -> Self {
        Self::Progress(task.into())
    }

    pub fn output(step: impl Into<String>) -> Self {
        Self::Output {
            step: step.into(),
            path: Vec::new(),
        }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self::Field {
            name: name.into(),
            path: Vec::new(),
        }
    }

    /// Read the referenced value. `None` when it does not exist yet.
    pub fn resolve(&self, state: &ExecutionState) -> Option<Value> {
        match self {
            Self::Progress(task) => state.progress(task).map(Value::from),
            Self::Output { step, path } => state.output(step).and_then(|v| walk(v, path)),
            Self::Field { name, path } => state.fields.get(name).and_then(|v| walk(v, path)),
            Self::Flag(flag) => Some(Value::Bool(state.control.flag(*flag))),
            Self::Steps(step) => Some(Value::from(state.completions(step))),
        }
    }
}

fn walk(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn write_path(f: &mut fmt::Formatter<'_>, head: &str, name: &str, path: &[String]) -> fmt::Result {
    write!(f, "{}.{}", head, name)?;
    for segment in path {
        write!(f, ".{}", segment)?;
    }
    Ok(())
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress(task) => write!(f, "progress.{}", task),
            Self::Output { step, path } => write_path(f, "output", step, path),
            Self::Field { name, path } => write_path(f, "field", name, path),
            Self::Flag(flag) => write!(f, "flag.{}", flag),
            Self::Steps(step) => write!(f, "steps.{}", step),
        }
    }
}

impl FromStr for FieldRef {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let head = parts.next().unwrap_or_default();
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SwarmError::SpecValidation(format!("incomplete reference: {}", s)))?
            .to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(|p| p.is_empty()) {
            return Err(SwarmError::SpecValidation(format!("empty path segment in: {}", s)));
        }
        let no_path = |r: FieldRef| {
            if path.is_empty() {
                Ok(r)
            } else {
                Err(SwarmError::SpecValidation(format!(
                    "reference does not take a path: {}",
                    s
                )))
            }
        };
        match head {
            "progress" => no_path(Self::Progress(name)),
            "steps" => no_path(Self::Steps(name)),
            "flag" => {
                let flag = ControlFlag::parse(&name)
                    .ok_or_else(|| SwarmError::SpecValidation(format!("unknown flag: {}", name)))?;
                no_path(Self::Flag(flag))
            }
            "output" => Ok(Self::Output {
                step: name,
                path: path.clone(),
            }),
            "field" => Ok(Self::Field {
                name,
                path: path.clone(),
            }),
            other => Err(SwarmError::SpecValidation(format!(
                "unknown reference root '{}' in: {}",
                other, s
            ))),
        }
    }
}

impl TryFrom<String> for FieldRef {
    type Error = SwarmError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<FieldRef> for String {
    fn from(r: FieldRef) -> Self {
        r.to_string()
    }
}

/// Comparison operator for [`Guard::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "contains")]
    Contains,
}

impl CompareOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }

    fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            Self::Eq => loose_eq(left, right),
            Self::Ne => !loose_eq(left, right),
            Self::Contains => match (left, right) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|i| loose_eq(i, needle)),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            },
            ordering => match compare(left, right) {
                Some(ord) => match ordering {
                    Self::Ge => ord != Ordering::Less,
                    Self::Le => ord != Ordering::Greater,
                    Self::Gt => ord == Ordering::Greater,
                    Self::Lt => ord == Ordering::Less,
                    _ => false,
                },
                None => false,
            },
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Contains => "contains",
        };
        write!(f, "{}", s)
    }
}

/// Boolean predicate attached to an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Guard {
    Always,
    /// The last applied step succeeded.
    OnSuccess,
    /// The last applied step was denied a capability.
    OnDenied,
    Compare {
        reference: FieldRef,
        op: CompareOp,
        value: Value,
    },
    /// Every listed task (every known task when empty) is at least `at_least`.
    AllProgress { tasks: Vec<String>, at_least: f64 },
    StepCompleted { step: String },
    Not { guard: Box<Guard> },
    All { guards: Vec<Guard> },
    Any { guards: Vec<Guard> },
}

impl Guard {
    pub fn all_progress(tasks: Vec<String>, at_least: f64) -> Self {
        Self::AllProgress { tasks, at_least }
    }

    pub fn completed(step: impl Into<String>) -> Self {
        Self::StepCompleted { step: step.into() }
    }

    pub fn negate(guard: Guard) -> Self {
        match guard {
            Self::Not { guard } => *guard,
            other => Self::Not {
                guard: Box::new(other),
            },
        }
    }

    /// Conjunction, flattening `Always` and single-element lists.
    pub fn and(guards: Vec<Guard>) -> Self {
        let mut guards: Vec<Guard> = guards
            .into_iter()
            .filter(|g| !matches!(g, Self::Always))
            .collect();
        match guards.len() {
            0 => Self::Always,
            1 => guards.remove(0),
            _ => Self::All { guards },
        }
    }

    /// Disjunction; a single guard is returned unchanged.
    pub fn or(mut guards: Vec<Guard>) -> Self {
        if guards.iter().any(|g| matches!(g, Self::Always)) {
            return Self::Always;
        }
        match guards.len() {
            1 => guards.remove(0),
            _ => Self::Any { guards },
        }
    }

    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        match self {
            Self::Always => true,
            Self::OnSuccess => state.control.last_outcome == Some(StepOutcome::Succeeded),
            Self::OnDenied => state.control.last_outcome == Some(StepOutcome::Denied),
            Self::Compare {
                reference,
                op,
                value,
            } => reference
                .resolve(state)
                .map(|left| op.apply(&left, value))
                .unwrap_or(false),
            Self::AllProgress { tasks, at_least } => {
                if tasks.is_empty() {
                    !state.task_progress.is_empty()
                        && state.task_progress.values().all(|p| *p >= *at_least)
                } else {
                    tasks.iter().all(|t| {
                        state
                            .progress(t)
                            .map(|p| p >= *at_least)
                            .unwrap_or(false)
                    })
                }
            }
            Self::StepCompleted { step } => state.completions(step) > 0,
            Self::Not { guard } => !guard.evaluate(state),
            Self::All { guards } => guards.iter().all(|g| g.evaluate(state)),
            Self::Any { guards } => guards.iter().any(|g| g.evaluate(state)),
        }
    }

    /// Every state reference this guard reads.
    pub fn references(&self) -> Vec<FieldRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<FieldRef>) {
        match self {
            Self::Always | Self::OnSuccess | Self::OnDenied => {}
            Self::Compare { reference, .. } => out.push(reference.clone()),
            Self::AllProgress { tasks, .. } => {
                out.extend(tasks.iter().cloned().map(FieldRef::Progress))
            }
            Self::StepCompleted { step } => out.push(FieldRef::Steps(step.clone())),
            Self::Not { guard } => guard.collect_references(out),
            Self::All { guards } | Self::Any { guards } => {
                for g in guards {
                    g.collect_references(out);
                }
            }
        }
    }

    /// Parse a textual condition.
    ///
    /// Grammar: `a || b`, `a && b` (binds tighter), `!atom`, and atoms
    /// `ref OP literal`, `all(progress) OP n`, a bare `ref` (true when the
    /// value equals `true`), `true`, `success`, `denied`.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(SwarmError::SpecValidation("empty condition".into()));
        }
        let alternatives = expr
            .split("||")
            .map(|alt| {
                let terms = alt
                    .split("&&")
                    .map(parse_atom)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::and(terms))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::or(alternatives))
    }
}

fn comparison_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][\w\-]*(?:\.[\w\-]+)+)\s*(==|!=|>=|<=|>|<|\bcontains\b)\s*(.+)$").ok()
    })
    .as_ref()
}

fn all_progress_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^all\(\s*progress\s*\)\s*(==|>=)\s*([0-9]+(?:\.[0-9]+)?)$").ok()
    })
    .as_ref()
}

fn parse_atom(raw: &str) -> Result<Guard> {
    let atom = raw.trim();
    if atom.is_empty() {
        return Err(SwarmError::SpecValidation("empty term in condition".into()));
    }
    if let Some(rest) = atom.strip_prefix('!') {
        if !rest.starts_with('=') {
            return Ok(Guard::negate(parse_atom(rest)?));
        }
    }
    match atom {
        "true" | "always" => return Ok(Guard::Always),
        "success" => return Ok(Guard::OnSuccess),
        "denied" => return Ok(Guard::OnDenied),
        _ => {}
    }
    if let Some(caps) = all_progress_regex().and_then(|re| re.captures(atom)) {
        let at_least: f64 = caps[2]
            .parse()
            .map_err(|_| SwarmError::SpecValidation(format!("bad number in: {}", atom)))?;
        return Ok(Guard::all_progress(Vec::new(), at_least));
    }
    if let Some(caps) = comparison_regex().and_then(|re| re.captures(atom)) {
        let reference: FieldRef = caps[1].parse()?;
        let op = CompareOp::parse(&caps[2])
            .ok_or_else(|| SwarmError::SpecValidation(format!("bad operator in: {}", atom)))?;
        let value = parse_literal(caps[3].trim());
        return Ok(Guard::Compare {
            reference,
            op,
            value,
        });
    }
    let reference: FieldRef = atom.parse()?;
    Ok(Guard::Compare {
        reference,
        op: CompareOp::Eq,
        value: Value::Bool(true),
    })
}

fn parse_literal(raw: &str) -> Value {
    if let Some(inner) = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
    {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
