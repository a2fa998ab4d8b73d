//! Shared test doubles and spec fixtures for swarmflow crates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Notify;

use swarmflow_core::config::AppConfig;
use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::patch::StatePatch;
use swarmflow_core::spec::{Constraint, Participant, Pattern, Phase, WorkflowSpec};
use swarmflow_core::traits::{CapabilityInvoker, StepContext, StepHandler};

/// Dispatch order shared across handlers.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// The patch a well-behaved participant returns: one message, an output and
/// full progress on its task.
pub fn completion_patch(ctx: &StepContext) -> StatePatch {
    StatePatch::new()
        .with_message(ctx.participant.clone(), format!("{} done", ctx.participant))
        .with_output(ctx.step_id.clone(), json!(format!("{}:done", ctx.participant)))
        .with_progress(ctx.task.clone(), 100.0)
}

type Script = Arc<dyn Fn(&StepContext) -> Result<StatePatch> + Send + Sync>;

/// Handler driven by a closure. Records every participant it ran for.
pub struct ScriptedHandler {
    script: Script,
    delay: Option<Duration>,
    log: CallLog,
}

impl ScriptedHandler {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&StepContext) -> Result<StatePatch> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            delay: None,
            log: CallLog::default(),
        }
    }

    /// Always returns [`completion_patch`].
    pub fn completing() -> Self {
        Self::new(|ctx| Ok(completion_patch(ctx)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

impl StepHandler for ScriptedHandler {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
        Box::pin(async move {
            self.log.push(ctx.participant.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.script)(&ctx)
        })
    }
}

/// Fails the first `failures` attempts, then completes.
pub struct FailingHandler {
    failures: u32,
    attempts: AtomicU32,
}

impl FailingHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
        }
    }

    /// Never succeeds.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StepHandler for FailingHandler {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
        Box::pin(async move {
            let seen = self.attempts.fetch_add(1, Ordering::SeqCst);
            if seen < self.failures {
                return Err(SwarmError::StepExecution {
                    step: ctx.step_id.clone(),
                    message: format!("scripted failure {}", seen + 1),
                });
            }
            Ok(completion_patch(&ctx))
        })
    }
}

/// Signals `started`, then waits for `release` before completing.
///
/// Lets a test act on a run while one of its steps is in flight.
#[derive(Clone, Default)]
pub struct BlockingHandler {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl BlockingHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepHandler for BlockingHandler {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
        Box::pin(async move {
            self.started.notify_one();
            self.release.notified().await;
            Ok(completion_patch(&ctx))
        })
    }
}

/// Invokes one capability through the gated client and stores the result as
/// its output. Denials propagate to the engine.
pub struct CapabilityHandler {
    capability: String,
    params: Value,
}

impl CapabilityHandler {
    pub fn new(capability: impl Into<String>, params: Value) -> Self {
        Self {
            capability: capability.into(),
            params,
        }
    }
}

impl StepHandler for CapabilityHandler {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
        Box::pin(async move {
            let result = ctx
                .capabilities
                .invoke(self.capability.clone(), self.params.clone())
                .await?;
            Ok(StatePatch::new()
                .with_output(ctx.step_id.clone(), result)
                .with_progress(ctx.task.clone(), 100.0))
        })
    }
}

/// One recorded capability invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub capability: String,
    pub params: Value,
    pub at: DateTime<Utc>,
}

/// Capability backend that echoes its input unless a canned response is set.
#[derive(Default)]
pub struct MockInvoker {
    responses: HashMap<String, Value>,
    calls: Mutex<Vec<Invocation>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, capability: impl Into<String>, response: Value) -> Self {
        self.responses.insert(capability.into(), response);
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

impl CapabilityInvoker for MockInvoker {
    fn invoke(&self, capability: String, params: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(Invocation {
                    capability: capability.clone(),
                    params: params.clone(),
                    at: Utc::now(),
                });
            }
            Ok(self
                .responses
                .get(&capability)
                .cloned()
                .unwrap_or_else(|| json!({ "capability": capability, "echo": params })))
        })
    }
}

/// `ids` in one phase of the given pattern, every participant with role
/// `worker`.
pub fn single_phase_spec(name: &str, pattern: Pattern, ids: &[&str]) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new(name);
    for id in ids {
        spec = spec.with_participant(Participant::new(*id, "worker"));
    }
    spec.with_phase(Phase::new("main", pattern, ids))
}

pub fn sequential_spec(ids: &[&str]) -> WorkflowSpec {
    single_phase_spec("pipeline", Pattern::Sequential, ids)
}

pub fn parallel_spec(ids: &[&str]) -> WorkflowSpec {
    single_phase_spec("fanout", Pattern::Parallel, ids)
}

/// Sequential `ids` with an interrupt gate before `gated`.
pub fn gated_spec(ids: &[&str], gated: &str) -> WorkflowSpec {
    sequential_spec(ids).with_constraint(Constraint::RequireApproval {
        participant: gated.to_string(),
    })
}

/// `a → b → c`, where `a` needs `capability` and falls back to `c` when it is
/// denied.
pub fn denial_fallback_spec(capability: &str) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("fallback");
    let mut a = Participant::new("a", "caller");
    a.capabilities.push(capability.to_string());
    spec = spec
        .with_participant(a)
        .with_participant(Participant::new("b", "worker"))
        .with_participant(Participant::new("c", "worker"))
        .with_phase(Phase::new("main", Pattern::Sequential, &["a", "b", "c"]))
        .with_constraint(Constraint::OnDenied {
            participant: "a".into(),
            fallback: "c".into(),
        });
    spec
}

/// Temporary workspace with a config pointing all storage inside it.
pub struct TestWorkspace {
    pub dir: tempfile::TempDir,
    pub config: AppConfig,
}

impl TestWorkspace {
    /// `extra` is appended to the generated TOML, e.g. a `[permissions]`
    /// table.
    pub fn new(backend: &str, extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp workspace");
        let root = dir.path().display().to_string();
        let content = format!(
            r#"
[engine]
workspace = "{root}"
max_step_visits = 20

[engine.retry]
max_retries = 2
initial_backoff_ms = 1
max_backoff_ms = 5

[checkpoint]
backend = "{backend}"

[log]
enabled = true
level = 3

[gateway]
approval_timeout_secs = 1
{extra}
"#
        );
        let config: AppConfig = toml::from_str(&content).expect("parse test config");
        Self { dir, config }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Write `content` under the workspace and return its path.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write fixture file");
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use swarmflow_core::config::BackendKind;
    use swarmflow_core::state::ExecutionState;
    use swarmflow_core::traits::NoCapabilities;
    use swarmflow_core::types::RunId;

    fn ctx(participant: &str) -> StepContext {
        StepContext {
            run_id: RunId::from_string("r"),
            step_id: participant.into(),
            participant: participant.into(),
            role: "worker".into(),
            task: participant.into(),
            attempt: 0,
            view: Arc::new(ExecutionState::new()),
            capabilities: Arc::new(NoCapabilities),
        }
    }

    #[tokio::test]
    async fn failing_handler_recovers_after_failures() {
        let handler = FailingHandler::new(2);
        assert!(handler.execute(ctx("a")).await.is_err());
        assert!(handler.execute(ctx("a")).await.is_err());
        let patch = handler.execute(ctx("a")).await.unwrap();
        assert_eq!(patch.task_progress["a"], 100.0);
        assert_eq!(handler.attempts(), 3);
    }

    #[tokio::test]
    async fn scripted_handler_logs_calls() {
        let log = CallLog::default();
        let handler = ScriptedHandler::completing().with_log(log.clone());
        handler.execute(ctx("a")).await.unwrap();
        handler.execute(ctx("b")).await.unwrap();
        assert_eq!(log.entries(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn mock_invoker_echoes_and_records() {
        let invoker = MockInvoker::new().with_response("search", json!(["hit"]));
        let hit = invoker.invoke("search".into(), json!({"q": "x"})).await.unwrap();
        assert_eq!(hit, json!(["hit"]));
        let echo = invoker.invoke("fetch".into(), json!(1)).await.unwrap();
        assert_eq!(echo["echo"], 1);
        assert_eq!(invoker.call_count(), 2);
    }

    #[test]
    fn fixtures_validate() {
        sequential_spec(&["a", "b"]).validate().unwrap();
        parallel_spec(&["a", "b", "c"]).validate().unwrap();
        gated_spec(&["a", "b"], "b").validate().unwrap();
        denial_fallback_spec("search").validate().unwrap();
    }

    #[test]
    fn workspace_config_points_inside_tempdir() {
        let ws = TestWorkspace::new("sqlite", "");
        assert_eq!(ws.config.checkpoint.backend, BackendKind::Sqlite);
        assert!(ws.config.checkpoint_path().starts_with(ws.path()));
        assert!(ws.config.log_dir().starts_with(ws.path()));
        assert_eq!(ws.config.engine.retry.max_retries, 2);
    }
}
