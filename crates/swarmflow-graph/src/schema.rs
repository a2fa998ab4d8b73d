use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The state layout a compiled graph expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    /// Step ids that write outputs.
    pub outputs: BTreeSet<String>,
    /// Task progress keys.
    pub tasks: BTreeSet<String>,
    /// Declared fields with their defaults.
    pub fields: BTreeMap<String, Value>,
}

/// What changes when state built for one schema moves to another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub removed_outputs: Vec<String>,
    pub removed_tasks: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_fields.is_empty()
            && self.removed_fields.is_empty()
            && self.removed_outputs.is_empty()
            && self.removed_tasks.is_empty()
    }
}

impl StateSchema {
    /// Changes needed to go from `self` to `next`.
    pub fn diff(&self, next: &StateSchema) -> SchemaDiff {
        SchemaDiff {
            added_fields: next
                .fields
                .keys()
                .filter(|k| !self.fields.contains_key(*k))
                .cloned()
                .collect(),
            removed_fields: self
                .fields
                .keys()
                .filter(|k| !next.fields.contains_key(*k))
                .cloned()
                .collect(),
            removed_outputs: self.outputs.difference(&next.outputs).cloned().collect(),
            removed_tasks: self.tasks.difference(&next.tasks).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(outputs: &[&str], tasks: &[&str], fields: &[(&str, Value)]) -> StateSchema {
        StateSchema {
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            tasks: tasks.iter().map(|s| s.to_string()).collect(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn diff_reports_additions_and_removals() {
        let old = schema(&["a", "b"], &["ta", "tb"], &[("x", json!(1)), ("y", json!(2))]);
        let new = schema(&["a", "c"], &["ta", "tc"], &[("x", json!(1)), ("z", json!(0))]);
        let diff = old.diff(&new);
        assert_eq!(diff.added_fields, vec!["z"]);
        assert_eq!(diff.removed_fields, vec!["y"]);
        assert_eq!(diff.removed_outputs, vec!["b"]);
        assert_eq!(diff.removed_tasks, vec!["tb"]);
        assert!(!diff.is_empty());
        assert!(old.diff(&old).is_empty());
    }
}
