use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};
use crate::permission::{PermissionMatrix, PermissionRule};
use crate::types::RetryPolicy;

/// Top-level swarmflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// participant → capability → `allow` | `deny` | `approval` | `quota:<n>`.
    /// Seeded into every new run.
    #[serde(default)]
    pub permissions: BTreeMap<String, BTreeMap<String, String>>,
}

/// What happens to the in-flight step when a run is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Let the step finish and checkpoint it, then fail the run.
    #[default]
    Complete,
    /// Drop the step without applying its patch.
    Abandon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Working directory for the database and logs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// A step dispatched more often than this fails the run.
    #[serde(default = "default_max_step_visits")]
    pub max_step_visits: u32,
    #[serde(default)]
    pub cancel_mode: CancelMode,
    /// Retry policy for participants that declare none.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_step_visits: default_max_step_visits(),
            cancel_mode: CancelMode::default(),
            retry: RetryPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_workspace() -> String { "~/.swarmflow".to_string() }
fn default_max_step_visits() -> u32 { 50 }
fn default_event_capacity() -> usize { 1024 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    #[default]
    Sqlite,
}

/// Checkpoint storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// SQLite file. Default: <workspace>/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL trace logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per-step, 3 = routing and permission detail.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Seconds to wait for an external approval decision.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
        }
    }
}

fn default_approval_timeout() -> u64 { 60 }

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SwarmError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| SwarmError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log
            .log_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("logs"))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.workspace_dir().join("checkpoints.db"))
    }

    /// Build the permission matrix seeded into new runs.
    pub fn permission_matrix(&self) -> Result<PermissionMatrix> {
        let mut matrix = PermissionMatrix::new();
        for (participant, caps) in &self.permissions {
            for (capability, rule) in caps {
                let rule = parse_rule(rule).map_err(|e| {
                    SwarmError::Config(format!("permissions.{}.{}: {}", participant, capability, e))
                })?;
                matrix.set(participant.clone(), capability.clone(), rule);
            }
        }
        Ok(matrix)
    }
}

fn parse_rule(raw: &str) -> std::result::Result<PermissionRule, String> {
    if let Some(limit) = raw.strip_prefix("quota:") {
        let limit = limit
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid quota limit: {}", limit))?;
        return Ok(PermissionRule::Quota { limit });
    }
    PermissionRule::from_str(raw)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_SWARMFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_SWARMFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_SWARMFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_SWARMFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_SWARMFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_step_visits, 50);
        assert_eq!(config.engine.cancel_mode, CancelMode::Complete);
        assert_eq!(config.checkpoint.backend, BackendKind::Sqlite);
        assert!(config.log.enabled);
        assert_eq!(config.log.level, 2);
        assert_eq!(config.gateway.approval_timeout_secs, 60);
        assert!(config.permissions.is_empty());
    }

    #[test]
    fn test_full_config() {
        let toml_str = r#"
[engine]
workspace = "/tmp/sf"
max_step_visits = 8
cancel_mode = "abandon"

[engine.retry]
max_retries = 4
initial_backoff_ms = 10

[checkpoint]
backend = "memory"

[log]
level = 3
log_dir = "/tmp/sf-logs"

[gateway]
approval_timeout_secs = 5

[permissions.writer]
search = "allow"
deploy = "deny"
publish = "approval"
fetch = "quota:3"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_step_visits, 8);
        assert_eq!(config.engine.cancel_mode, CancelMode::Abandon);
        assert_eq!(config.engine.retry.max_retries, 4);
        assert_eq!(config.engine.retry.max_backoff_ms, 5_000);
        assert_eq!(config.checkpoint.backend, BackendKind::Memory);
        assert_eq!(config.checkpoint_path(), PathBuf::from("/tmp/sf/checkpoints.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/sf-logs"));

        let matrix = config.permission_matrix().unwrap();
        assert_eq!(matrix.get("writer", "search"), Some(&PermissionRule::Allow));
        assert_eq!(matrix.get("writer", "deploy"), Some(&PermissionRule::Deny));
        assert_eq!(matrix.get("writer", "publish"), Some(&PermissionRule::Approval));
        assert_eq!(
            matrix.get("writer", "fetch"),
            Some(&PermissionRule::Quota { limit: 3 })
        );
    }

    #[test]
    fn test_bad_permission_rule() {
        let config: AppConfig = toml::from_str("[permissions.qa]\nsearch = \"sometimes\"").unwrap();
        let err = config.permission_matrix().unwrap_err();
        assert!(err.to_string().contains("permissions.qa.search"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/swarmflow.toml")).unwrap_err();
        assert!(matches!(err, SwarmError::ConfigNotFound(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarmflow.toml");
        std::fs::write(&path, "[engine]\nmax_step_visits = 3\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.engine.max_step_visits, 3);
    }
}
