use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::migration::{schema_version_of, MigrationRegistry};
use swarmflow_core::state::{ExecutionState, CURRENT_SCHEMA_VERSION};
use swarmflow_core::traits::CheckpointBackend;
use swarmflow_core::types::RunId;

use crate::diff::{diff_values, FieldChange};

const ENVELOPE_FORMAT: u32 = 1;

/// An immutable, sequenced snapshot of a run's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Graph in effect when the snapshot was taken.
    pub graph_id: String,
    pub state: ExecutionState,
    /// Schema version the stored state had, when it had to be migrated.
    pub migrated_from: Option<u32>,
}

/// Listing entry; does not carry the state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointMeta {
    pub run_id: String,
    pub sequence: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub graph_id: Option<String>,
    pub schema_version: Option<u32>,
    /// False when the blob fails to decode or its checksum does not match.
    pub intact: bool,
}

/// Outcome of [`CheckpointManager::recover_latest`].
#[derive(Debug, Clone)]
pub struct Recovered {
    pub checkpoint: Checkpoint,
    /// Newer sequences that were unusable, newest first.
    pub skipped: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u32,
    /// blake3 of `body`.
    checksum: String,
    body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Body {
    run_id: String,
    sequence: u64,
    timestamp: DateTime<Utc>,
    graph_id: String,
    state: Value,
}

/// Ordering, integrity and migration on top of a byte backend.
pub struct CheckpointManager {
    backend: Arc<dyn CheckpointBackend>,
    migrations: MigrationRegistry,
    /// run id → last sequence written or observed.
    last: Mutex<BTreeMap<String, u64>>,
}

impl CheckpointManager {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self {
            backend,
            migrations: MigrationRegistry::default(),
            last: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Persist `state` as the next checkpoint of `run_id`.
    pub fn save(&self, run_id: &RunId, state: &ExecutionState, graph_id: &str) -> Result<Checkpoint> {
        let next = self.last_sequence(run_id)? + 1;
        self.save_at(run_id, next, state, graph_id)
    }

    /// Persist with an explicit sequence; anything but `last + 1` is refused.
    pub fn save_at(
        &self,
        run_id: &RunId,
        sequence: u64,
        state: &ExecutionState,
        graph_id: &str,
    ) -> Result<Checkpoint> {
        let expected = self.last_sequence(run_id)? + 1;
        if sequence != expected {
            return Err(SwarmError::CheckpointGap {
                run_id: run_id.to_string(),
                expected,
                got: sequence,
            });
        }

        let timestamp = Utc::now();
        let body = serde_json::to_string(&Body {
            run_id: run_id.to_string(),
            sequence,
            timestamp,
            graph_id: graph_id.to_string(),
            state: serde_json::to_value(state)?,
        })?;
        let envelope = Envelope {
            format: ENVELOPE_FORMAT,
            checksum: checksum(&body),
            body,
        };
        let blob = serde_json::to_vec(&envelope)?;
        self.backend.put(&key(run_id.as_str(), sequence), &blob)?;

        self.last_cache()?.insert(run_id.to_string(), sequence);
        debug!(run_id = %run_id, sequence, bytes = blob.len(), "Checkpoint saved");

        Ok(Checkpoint {
            run_id: run_id.clone(),
            sequence,
            timestamp,
            graph_id: graph_id.to_string(),
            state: state.clone(),
            migrated_from: None,
        })
    }

    /// Highest stored sequence for the run, 0 when there is none.
    pub fn last_sequence(&self, run_id: &RunId) -> Result<u64> {
        if let Some(&seq) = self.last_cache()?.get(run_id.as_str()) {
            return Ok(seq);
        }
        let seq = self.sequences(run_id.as_str())?.last().copied().unwrap_or(0);
        self.last_cache()?.insert(run_id.to_string(), seq);
        Ok(seq)
    }

    pub fn load_at(&self, run_id: &RunId, sequence: u64) -> Result<Checkpoint> {
        let blob = self
            .backend
            .get(&key(run_id.as_str(), sequence))?
            .ok_or_else(|| SwarmError::CheckpointNotFound {
                run_id: run_id.to_string(),
                sequence,
            })?;
        let body = open(run_id.as_str(), sequence, &blob)?;
        self.materialize(run_id, sequence, body)
    }

    pub fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        match self.sequences(run_id.as_str())?.last() {
            Some(&seq) => self.load_at(run_id, seq).map(Some),
            None => Ok(None),
        }
    }

    /// Metadata for every checkpoint of the run, oldest first.
    pub fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>> {
        let mut metas = Vec::new();
        for sequence in self.sequences(run_id.as_str())? {
            let blob = self.backend.get(&key(run_id.as_str(), sequence))?;
            let body = blob.and_then(|b| open(run_id.as_str(), sequence, &b).ok());
            metas.push(match body {
                Some(body) => CheckpointMeta {
                    run_id: body.run_id,
                    sequence,
                    timestamp: Some(body.timestamp),
                    graph_id: Some(body.graph_id),
                    schema_version: Some(schema_version_of(&body.state)),
                    intact: true,
                },
                None => CheckpointMeta {
                    run_id: run_id.to_string(),
                    sequence,
                    timestamp: None,
                    graph_id: None,
                    schema_version: None,
                    intact: false,
                },
            });
        }
        Ok(metas)
    }

    /// Every checkpoint of the run, oldest first. Fails on the first
    /// unusable one.
    pub fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>> {
        self.sequences(run_id.as_str())?
            .into_iter()
            .map(|seq| self.load_at(run_id, seq))
            .collect()
    }

    /// Field-level delta between two checkpoints of the same run.
    pub fn diff(&self, run_id: &RunId, from: u64, to: u64) -> Result<Vec<FieldChange>> {
        let a = self.load_at(run_id, from)?;
        let b = self.load_at(run_id, to)?;
        Ok(diff_values(
            &serde_json::to_value(&a.state)?,
            &serde_json::to_value(&b.state)?,
        ))
    }

    /// Newest usable checkpoint, walking back past corrupt ones.
    ///
    /// `Ok(None)` when the run has no checkpoints; `CheckpointCorruption`
    /// when it has some but none can be used.
    pub fn recover_latest(&self, run_id: &RunId) -> Result<Option<Recovered>> {
        let sequences = self.sequences(run_id.as_str())?;
        let mut skipped = Vec::new();
        let mut first_error = None;
        for &sequence in sequences.iter().rev() {
            match self.load_at(run_id, sequence) {
                Ok(checkpoint) => {
                    if !skipped.is_empty() {
                        warn!(
                            run_id = %run_id,
                            recovered = sequence,
                            skipped = ?skipped,
                            "Recovered from older checkpoint"
                        );
                    }
                    return Ok(Some(Recovered {
                        checkpoint,
                        skipped,
                    }));
                }
                Err(e @ SwarmError::StateSchemaMismatch { .. }) => return Err(e),
                Err(e) => {
                    warn!(run_id = %run_id, sequence, error = %e, "Skipping unusable checkpoint");
                    skipped.push(sequence);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(None),
            Some(e @ SwarmError::CheckpointCorruption { .. }) => Err(e),
            Some(e) => Err(SwarmError::CheckpointCorruption {
                run_id: run_id.to_string(),
                sequence: sequences.last().copied().unwrap_or(0),
                reason: e.to_string(),
            }),
        }
    }

    /// Run ids that have at least one checkpoint.
    pub fn runs(&self) -> Result<Vec<String>> {
        let mut runs: Vec<String> = self
            .backend
            .list("run/")?
            .iter()
            .filter_map(|k| parse_key(k).map(|(run, _)| run))
            .collect();
        runs.dedup();
        Ok(runs)
    }

    fn sequences(&self, run_id: &str) -> Result<Vec<u64>> {
        let mut seqs: Vec<u64> = self
            .backend
            .list(&prefix(run_id))?
            .iter()
            .filter_map(|k| parse_key(k))
            .filter(|(run, _)| run == run_id)
            .map(|(_, seq)| seq)
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    fn materialize(&self, run_id: &RunId, sequence: u64, body: Body) -> Result<Checkpoint> {
        let version = schema_version_of(&body.state);
        let (state, migrated_from) = if version == CURRENT_SCHEMA_VERSION {
            let state = serde_json::from_value(body.state).map_err(|e| {
                SwarmError::CheckpointCorruption {
                    run_id: run_id.to_string(),
                    sequence,
                    reason: format!("state does not decode: {}", e),
                }
            })?;
            (state, None)
        } else {
            let migrated = self.migrations.migrate_to_current(&body.state)?;
            info!(
                run_id = %run_id,
                sequence,
                from = migrated.from,
                to = CURRENT_SCHEMA_VERSION,
                "Migrated checkpoint state"
            );
            (migrated.state, Some(version))
        };
        Ok(Checkpoint {
            run_id: run_id.clone(),
            sequence,
            timestamp: body.timestamp,
            graph_id: body.graph_id,
            state,
            migrated_from,
        })
    }

    fn last_cache(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, u64>>> {
        self.last
            .lock()
            .map_err(|e| SwarmError::LockPoisoned(e.to_string()))
    }
}

/// Decode and verify a stored blob.
fn open(run_id: &str, sequence: u64, blob: &[u8]) -> Result<Body> {
    let corrupt = |reason: String| SwarmError::CheckpointCorruption {
        run_id: run_id.to_string(),
        sequence,
        reason,
    };
    let envelope: Envelope =
        serde_json::from_slice(blob).map_err(|e| corrupt(format!("envelope does not decode: {}", e)))?;
    if envelope.format != ENVELOPE_FORMAT {
        return Err(corrupt(format!("unknown envelope format {}", envelope.format)));
    }
    if checksum(&envelope.body) != envelope.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    let body: Body =
        serde_json::from_str(&envelope.body).map_err(|e| corrupt(format!("body does not decode: {}", e)))?;
    if body.run_id != run_id || body.sequence != sequence {
        return Err(corrupt(format!(
            "stored under run {} #{}",
            body.run_id, body.sequence
        )));
    }
    Ok(body)
}

fn checksum(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}

/// Run ids are escaped so a `/` inside one cannot reach another run's keys.
fn segment(run_id: &str) -> String {
    run_id.replace('%', "%25").replace('/', "%2F")
}

fn unsegment(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

fn prefix(run_id: &str) -> String {
    format!("run/{}/", segment(run_id))
}

fn key(run_id: &str, sequence: u64) -> String {
    format!("run/{}/{:020}", segment(run_id), sequence)
}

fn parse_key(key: &str) -> Option<(String, u64)> {
    let rest = key.strip_prefix("run/")?;
    let (run, seq) = rest.split_once('/')?;
    Some((unsegment(run), seq.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_numerically() {
        assert!(key("r", 9) < key("r", 10));
        assert_eq!(parse_key(&key("r", 42)), Some(("r".to_string(), 42)));
        assert_eq!(parse_key("run/r/notanumber"), None);
        assert_eq!(parse_key("other/r/1"), None);
    }

    #[test]
    fn slashes_in_run_ids_stay_inside_one_run() {
        assert_eq!(key("r/x", 1), "run/r%2Fx/00000000000000000001");
        assert!(!key("r/x", 1).starts_with(&prefix("r")));
        assert_eq!(parse_key(&key("r/x", 7)), Some(("r/x".to_string(), 7)));
        assert_eq!(parse_key(&key("50%/2F", 1)), Some(("50%/2F".to_string(), 1)));
    }

    #[test]
    fn open_rejects_tampered_body() {
        let body = r#"{"run_id":"r","sequence":1,"timestamp":"2024-01-01T00:00:00Z","graph_id":"g","state":{}}"#;
        let mut envelope = Envelope {
            format: ENVELOPE_FORMAT,
            checksum: checksum(body),
            body: body.to_string(),
        };
        let blob = serde_json::to_vec(&envelope).unwrap();
        assert!(open("r", 1, &blob).is_ok());
        assert!(matches!(
            open("r", 2, &blob),
            Err(SwarmError::CheckpointCorruption { .. })
        ));

        envelope.body = envelope.body.replace("\"g\"", "\"h\"");
        let blob = serde_json::to_vec(&envelope).unwrap();
        let err = open("r", 1, &blob).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
