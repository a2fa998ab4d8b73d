use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use swarmflow_core::config::{AppConfig, BackendKind};
use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::event::EventBus;
use swarmflow_core::migration::MigrationRegistry;
use swarmflow_core::permission::{ApprovalDecision, ApprovalRequest, PermissionRule};
use swarmflow_core::spec::WorkflowSpec;
use swarmflow_core::state::ExecutionState;
use swarmflow_core::traits::{CapabilityInvoker, CheckpointBackend};
use swarmflow_core::types::{ResumeAction, RunEvent, RunId, RunStatus, TraceRecord};
use swarmflow_store::{CheckpointManager, CheckpointMeta, FieldChange, InMemoryBackend, SqliteBackend};

use crate::approval::ApprovalBroker;
use crate::handlers::HandlerRegistry;
use crate::run::{Run, RunDeps, RunHandle, RunSettings};
use crate::trace_log::TraceLogger;

struct RunSlot {
    handle: Arc<RunHandle>,
    run: Arc<Mutex<Run>>,
}

/// Control surface over every run this process owns.
pub struct WorkflowRuntime {
    deps: RunDeps,
    trace_log: Option<(PathBuf, u8)>,
    runs: RwLock<HashMap<RunId, RunSlot>>,
}

impl WorkflowRuntime {
    pub fn new(deps: RunDeps) -> Self {
        Self {
            deps,
            trace_log: None,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Write a JSONL trace for every run into `dir`.
    pub fn with_trace_log(mut self, dir: PathBuf, level: u8) -> Self {
        self.trace_log = Some((dir, level));
        self
    }

    /// Wire up a runtime from configuration: checkpoint backend, settings,
    /// event bus and approval broker.
    pub fn from_config(
        config: &AppConfig,
        handlers: HandlerRegistry,
        invoker: Arc<dyn CapabilityInvoker>,
    ) -> Result<Self> {
        let backend: Arc<dyn CheckpointBackend> = match config.checkpoint.backend {
            BackendKind::Memory => Arc::new(InMemoryBackend::new()),
            BackendKind::Sqlite => {
                let path = config.checkpoint_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(SqliteBackend::open(&path)?)
            }
        };
        let events = Arc::new(EventBus::new(config.engine.event_capacity));
        let deps = RunDeps {
            checkpoints: Arc::new(CheckpointManager::new(backend)),
            handlers: Arc::new(handlers),
            invoker,
            broker: Arc::new(ApprovalBroker::new(events.clone())),
            events,
            migrations: Arc::new(MigrationRegistry::with_builtin()),
            settings: RunSettings::from_config(config)?,
        };
        info!(
            backend = deps.checkpoints.backend_name(),
            max_step_visits = deps.settings.max_step_visits,
            "Workflow runtime ready"
        );
        let runtime = Self::new(deps);
        Ok(if config.log.enabled {
            runtime.with_trace_log(config.log_dir(), config.log.level)
        } else {
            runtime
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.deps.events
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.deps.checkpoints
    }

    /// Compile the workflow spec and create a run in `Ready`.
    pub async fn submit_spec(&self, spec: WorkflowSpec) -> Result<RunId> {
        let id = RunId::new();
        let logger = self.spawn_logger(&id);
        let run = match Run::start_with_id(id.clone(), spec, self.deps.clone()) {
            Ok(run) => run,
            Err(e) => {
                if let Some(token) = logger {
                    token.cancel();
                }
                return Err(e);
            }
        };
        self.register(run).await;
        Ok(id)
    }

    /// Rebuild a run from its checkpoints.
    pub async fn recover(&self, run_id: &RunId, spec: WorkflowSpec) -> Result<RunStatus> {
        let logger = self.spawn_logger(run_id);
        let run = match Run::recover(run_id.clone(), spec, self.deps.clone()) {
            Ok(run) => run,
            Err(e) => {
                if let Some(token) = logger {
                    token.cancel();
                }
                return Err(e);
            }
        };
        let status = run.status();
        self.register(run).await;
        Ok(status)
    }

    async fn register(&self, run: Run) {
        let slot = RunSlot {
            handle: run.handle().clone(),
            run: Arc::new(Mutex::new(run)),
        };
        self.runs.write().await.insert(slot.handle.id().clone(), slot);
    }

    fn spawn_logger(&self, run_id: &RunId) -> Option<CancellationToken> {
        let (dir, level) = self.trace_log.clone()?;
        let token = CancellationToken::new();
        let rx = self.deps.events.subscribe();
        tokio::spawn(TraceLogger::new(dir, level).run(rx, run_id.clone(), token.clone()));
        Some(token)
    }

    /// Queue a new spec revision for a run in flight.
    pub async fn revise(&self, run_id: &RunId, spec: WorkflowSpec) -> Result<()> {
        self.handle(run_id).await?.submit_revision(spec)
    }

    /// Drive a run on the current task until it halts.
    pub async fn drive(&self, run_id: &RunId) -> Result<RunStatus> {
        let run = self.slot_run(run_id).await?;
        let mut run = run.lock().await;
        run.drive().await
    }

    /// Drive a run on a background task.
    pub async fn start(&self, run_id: &RunId) -> Result<JoinHandle<Result<RunStatus>>> {
        let run = self.slot_run(run_id).await?;
        Ok(tokio::spawn(async move {
            let mut run = run.lock().await;
            run.drive().await
        }))
    }

    pub async fn pause(&self, run_id: &RunId) -> Result<()> {
        self.handle(run_id).await?.request_pause()
    }

    /// Resume a paused or interrupted run; drive it again afterwards.
    pub async fn resume(&self, run_id: &RunId, action: ResumeAction) -> Result<()> {
        let run = self.slot_run(run_id).await?;
        let run = run.lock().await;
        run.resume(action)
    }

    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        self.handle(run_id).await?.cancel()
    }

    pub async fn rollback(&self, run_id: &RunId, sequence: u64) -> Result<()> {
        let run = self.slot_run(run_id).await?;
        let mut run = run.lock().await;
        run.rollback(sequence)
    }

    pub async fn get_trace(&self, run_id: &RunId) -> Result<Vec<TraceRecord>> {
        Ok(self.handle(run_id).await?.trace().records())
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.handle(run_id).await?.status())
    }

    pub async fn failure(&self, run_id: &RunId) -> Result<Option<String>> {
        Ok(self.handle(run_id).await?.failure())
    }

    pub async fn state(&self, run_id: &RunId) -> Result<ExecutionState> {
        self.handle(run_id).await?.store().snapshot()
    }

    pub async fn update_permission(
        &self,
        run_id: &RunId,
        participant: &str,
        capability: &str,
        rule: PermissionRule,
    ) -> Result<()> {
        self.handle(run_id)
            .await?
            .update_permission(participant, capability, rule)
    }

    pub fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>> {
        self.deps.checkpoints.list(run_id)
    }

    pub fn diff(&self, run_id: &RunId, from: u64, to: u64) -> Result<Vec<FieldChange>> {
        self.deps.checkpoints.diff(run_id, from, to)
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.deps.broker.pending_requests().await
    }

    /// Answer an approval by full id or unique prefix.
    pub async fn respond_approval(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        self.deps.broker.respond(request_id, decision).await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.deps.events.subscribe()
    }

    pub async fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|slot| slot.handle.clone())
            .ok_or_else(|| SwarmError::RunNotFound(run_id.to_string()))
    }

    async fn slot_run(&self, run_id: &RunId) -> Result<Arc<Mutex<Run>>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|slot| slot.run.clone())
            .ok_or_else(|| SwarmError::RunNotFound(run_id.to_string()))
    }
}
