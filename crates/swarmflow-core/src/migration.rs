use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, SwarmError};
use crate::state::{ExecutionState, CURRENT_SCHEMA_VERSION};

/// A single schema hop over the serialized state.
pub type MigrationFn = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Result of bringing a serialized state up to date.
#[derive(Debug, Clone)]
pub struct Migrated {
    pub state: ExecutionState,
    pub from: u32,
    /// Versions visited, starting with `from` and ending at the target.
    pub path: Vec<u32>,
    /// The value exactly as it was before the first hop.
    pub backup: Value,
}

/// Registered `from → to` schema migrations.
pub struct MigrationRegistry {
    migrations: BTreeMap<(u32, u32), MigrationFn>,
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl MigrationRegistry {
    /// A registry with no migrations at all.
    pub fn empty() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    /// Registry holding the migrations shipped with this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(0, 1, migrate_v0_to_v1);
        registry
    }

    pub fn register<F>(&mut self, from: u32, to: u32, migration: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        if self.migrations.insert((from, to), Box::new(migration)).is_some() {
            warn!(from, to, "Replacing registered state migration");
        }
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Shortest chain of versions from `from` to `to`, breadth-first over
    /// registered hops in ascending target order.
    pub fn find_path(&self, from: u32, to: u32) -> Option<Vec<u32>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut parent: BTreeMap<u32, u32> = BTreeMap::new();
        let mut seen = BTreeSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(version) = queue.pop_front() {
            for &(_, next) in self.migrations.range((version, 0)..=(version, u32::MAX)).map(|(k, _)| k) {
                if !seen.insert(next) {
                    continue;
                }
                parent.insert(next, version);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&prev) = parent.get(&cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Migrate a serialized state to `target`.
    ///
    /// The input is never modified. A missing `schema_version` means version 0.
    pub fn migrate(&self, value: &Value, target: u32) -> Result<Migrated> {
        let from = schema_version_of(value);
        let path = self.find_path(from, target).ok_or(SwarmError::StateSchemaMismatch {
            found: from,
            expected: target,
        })?;

        let mut current = value.clone();
        for hop in path.windows(2) {
            let (a, b) = (hop[0], hop[1]);
            let migration = self
                .migrations
                .get(&(a, b))
                .ok_or_else(|| SwarmError::Migration(format!("missing migration v{} -> v{}", a, b)))?;
            debug!(from = a, to = b, "Applying state migration");
            current = migration(current)
                .map_err(|e| SwarmError::Migration(format!("v{} -> v{}: {}", a, b, e)))?;
            if let Value::Object(map) = &mut current {
                map.insert("schema_version".into(), json!(b));
            }
        }

        let state: ExecutionState = serde_json::from_value(current)
            .map_err(|e| SwarmError::Migration(format!("migrated state is invalid: {}", e)))?;
        if state.schema_version != target {
            return Err(SwarmError::Migration(format!(
                "migrated state reports v{}, expected v{}",
                state.schema_version, target
            )));
        }
        if path.len() > 1 {
            info!(from, to = target, hops = path.len() - 1, "State migrated");
        }
        Ok(Migrated {
            state,
            from,
            path,
            backup: value.clone(),
        })
    }

    /// Migrate to the schema version this build writes.
    pub fn migrate_to_current(&self, value: &Value) -> Result<Migrated> {
        self.migrate(value, CURRENT_SCHEMA_VERSION)
    }
}

pub fn schema_version_of(value: &Value) -> u32 {
    value
        .get("schema_version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Unversioned layout: outputs held bare values and progress carried a
/// stored `_overall` entry.
fn migrate_v0_to_v1(value: Value) -> Result<Value> {
    let Value::Object(mut map) = value else {
        return Err(SwarmError::Migration("state is not an object".into()));
    };

    if let Some(Value::Object(outputs)) = map.remove("outputs") {
        let now = chrono::Utc::now().to_rfc3339();
        let wrapped: Map<String, Value> = outputs
            .into_iter()
            .map(|(step, current)| {
                let record = if current.get("current").is_some() && current.get("updated_at").is_some() {
                    current
                } else {
                    json!({ "current": current, "history": [], "updated_at": now })
                };
                (step, record)
            })
            .collect();
        map.insert("outputs".into(), Value::Object(wrapped));
    }

    if let Some(Value::Object(progress)) = map.get_mut("task_progress") {
        progress.remove("_overall");
    }

    Ok(Value::Object(map))
}
