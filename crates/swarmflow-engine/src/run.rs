use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use swarmflow_core::config::{AppConfig, CancelMode};
use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::event::EventBus;
use swarmflow_core::migration::MigrationRegistry;
use swarmflow_core::patch::StatePatch;
use swarmflow_core::permission::{PermissionMatrix, PermissionRule};
use swarmflow_core::spec::WorkflowSpec;
use swarmflow_core::state::{ControlFlag, ExecutionState};
use swarmflow_core::traits::{CapabilityInvoker, StepContext};
use swarmflow_core::types::{
    ResumeAction, RetryPolicy, RunEvent, RunId, RunStatus, StepOutcome, TraceKind,
};
use swarmflow_graph::{CompiledGraph, GraphBuilder, Step, StepKind};
use swarmflow_store::CheckpointManager;

use crate::approval::ApprovalBroker;
use crate::control;
use crate::gateway::{CapabilityClient, PermissionGateway};
use crate::handlers::HandlerRegistry;
use crate::hotswap::{self, HotSwapCoordinator};
use crate::retry;
use crate::store::StateStore;
use crate::trace::TraceBook;

/// Engine knobs shared by every run of a runtime.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_step_visits: u32,
    pub cancel_mode: CancelMode,
    /// Used for participants that declare no retry policy.
    pub default_retry: RetryPolicy,
    pub approval_timeout: Duration,
    /// Seeded into every new run before declared capabilities.
    pub permissions: PermissionMatrix,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_step_visits: 50,
            cancel_mode: CancelMode::Complete,
            default_retry: RetryPolicy::default(),
            approval_timeout: Duration::from_secs(60),
            permissions: PermissionMatrix::new(),
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            max_step_visits: config.engine.max_step_visits,
            cancel_mode: config.engine.cancel_mode,
            default_retry: config.engine.retry.clone(),
            approval_timeout: Duration::from_secs(config.gateway.approval_timeout_secs),
            permissions: config.permission_matrix()?,
        })
    }
}

/// Collaborators a run needs. Everything is shared; cloning is cheap.
#[derive(Clone)]
pub struct RunDeps {
    pub checkpoints: Arc<CheckpointManager>,
    pub handlers: Arc<HandlerRegistry>,
    pub invoker: Arc<dyn CapabilityInvoker>,
    pub broker: Arc<ApprovalBroker>,
    pub events: Arc<EventBus>,
    pub migrations: Arc<MigrationRegistry>,
    pub settings: RunSettings,
}

/// The part of a run other tasks may touch while it is being driven.
pub struct RunHandle {
    id: RunId,
    store: Arc<StateStore>,
    trace: Arc<TraceBook>,
    status: Mutex<RunStatus>,
    pause_requested: AtomicBool,
    released_gate: Mutex<Option<String>>,
    failure: Mutex<Option<String>>,
    cancel: CancellationToken,
    swap: HotSwapCoordinator,
    events: Arc<EventBus>,
}

fn transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Ready, Running)
            | (Ready, Paused)
            | (Ready, Completed)
            | (Ready, Failed)
            | (Running, Paused)
            | (Running, AwaitingInterrupt)
            | (Running, Completed)
            | (Running, Failed)
            | (Paused, Ready)
            | (Paused, Failed)
            | (AwaitingInterrupt, Ready)
            | (AwaitingInterrupt, Failed)
    )
}

impl RunHandle {
    fn new(id: RunId, state: ExecutionState, revision: u64, events: Arc<EventBus>) -> Self {
        Self {
            trace: Arc::new(TraceBook::new(id.clone(), events.clone())),
            store: Arc::new(StateStore::new(state)),
            id,
            status: Mutex::new(RunStatus::Ready),
            pause_requested: AtomicBool::new(false),
            released_gate: Mutex::new(None),
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
            swap: HotSwapCoordinator::new(revision),
            events,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn trace(&self) -> &Arc<TraceBook> {
        &self.trace
    }

    pub fn status(&self) -> RunStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(RunStatus::Failed)
    }

    /// Why the run failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    pub fn is_stale(&self) -> bool {
        self.swap.is_stale()
    }

    fn transition(&self, to: RunStatus) -> Result<()> {
        let from = {
            let mut status = self
                .status
                .lock()
                .map_err(|e| SwarmError::LockPoisoned(e.to_string()))?;
            let from = *status;
            if from == to {
                return Ok(());
            }
            if !transition_allowed(from, to) {
                return Err(SwarmError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *status = to;
            from
        };
        debug!(run_id = %self.id, %from, %to, "Run status changed");
        self.events.publish(RunEvent::StatusChanged {
            run_id: self.id.clone(),
            from,
            to,
        });
        Ok(())
    }

    /// Ask a running run to stop at the next step boundary. A run that has
    /// not started pauses immediately.
    pub fn request_pause(&self) -> Result<()> {
        match self.status() {
            RunStatus::Running => {
                self.pause_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            RunStatus::Ready => {
                self.transition(RunStatus::Paused)?;
                self.trace.record(TraceKind::Paused {
                    cursor: self.store.snapshot()?.control.cursor,
                });
                Ok(())
            }
            other => Err(SwarmError::InvalidTransition {
                from: other.to_string(),
                to: RunStatus::Paused.to_string(),
            }),
        }
    }

    /// Cancel the run. A running run stops according to the cancel mode; an
    /// idle one fails at once.
    pub fn cancel(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(SwarmError::InvalidTransition {
                from: status.to_string(),
                to: RunStatus::Failed.to_string(),
            });
        }
        self.cancel.cancel();
        if status != RunStatus::Running {
            self.fail("cancelled")?;
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a spec revision for the next step boundary.
    pub fn submit_revision(&self, spec: WorkflowSpec) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(SwarmError::InvalidTransition {
                from: status.to_string(),
                to: "hot_swap".to_string(),
            });
        }
        let revision = spec.revision;
        self.swap.submit(spec)?;
        self.trace.record(TraceKind::HotSwapQueued { revision });
        info!(run_id = %self.id, revision, "Spec revision queued");
        Ok(())
    }

    /// Set one permission entry on the live matrix.
    pub fn update_permission(&self, participant: &str, capability: &str, rule: PermissionRule) -> Result<()> {
        self.store.set_permission(participant, capability, rule)?;
        self.trace.record(TraceKind::PermissionUpdated {
            participant: participant.to_string(),
            capability: capability.to_string(),
        });
        info!(run_id = %self.id, participant, capability, "Permission updated");
        Ok(())
    }

    fn fail(&self, reason: &str) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason.to_string());
        }
        self.trace.record(TraceKind::Failed {
            reason: reason.to_string(),
        });
        error!(run_id = %self.id, reason, "Run failed");
        Ok(())
    }

    fn halt(&self, to: RunStatus, kind: TraceKind) -> Result<RunStatus> {
        self.transition(to)?;
        self.trace.record(kind);
        Ok(to)
    }

    fn gate_released(&self, step: &str) -> bool {
        self.released_gate
            .lock()
            .map(|g| g.as_deref() == Some(step))
            .unwrap_or(false)
    }

    fn set_released_gate(&self, step: Option<String>) {
        if let Ok(mut gate) = self.released_gate.lock() {
            *gate = step;
        }
    }
}

/// What one pass of the loop decided.
enum Flow {
    Continue,
    Halt(RunStatus),
}

/// One run: its handle, the active spec and graph, and every graph it has
/// run under.
pub struct Run {
    handle: Arc<RunHandle>,
    spec: WorkflowSpec,
    graph: Arc<CompiledGraph>,
    gateway: Arc<PermissionGateway>,
    deps: RunDeps,
    revisions: Vec<(WorkflowSpec, Arc<CompiledGraph>)>,
}

impl Run {
    /// Compile the workflow spec, seed the state and take checkpoint #1.
    pub fn start(spec: WorkflowSpec, deps: RunDeps) -> Result<Self> {
        Self::start_with_id(RunId::new(), spec, deps)
    }

    pub fn start_with_id(id: RunId, spec: WorkflowSpec, deps: RunDeps) -> Result<Self> {
        let graph = Arc::new(GraphBuilder::compile(&spec)?);

        let mut matrix = deps.settings.permissions.clone();
        for participant in &spec.participants {
            for capability in &participant.capabilities {
                if matrix.get(&participant.id, capability).is_none() {
                    matrix.set(participant.id.clone(), capability.clone(), PermissionRule::Allow);
                }
            }
        }
        let mut state = ExecutionState::with_fields(spec.fields.clone()).with_permissions(matrix);
        state.control.cursor = Some(graph.entry.clone());

        let handle = Arc::new(RunHandle::new(id, state, spec.revision, deps.events.clone()));
        let run = Self::assemble(handle, spec, graph, deps);
        run.handle.trace.record(TraceKind::RunStarted {
            graph_id: run.graph.id.clone(),
            entry: run.graph.entry.clone(),
        });
        info!(
            run_id = %run.handle.id,
            workflow = %run.spec.name,
            graph = %run.graph.short_id(),
            "Run created"
        );
        run.checkpoint()?;
        Ok(run)
    }

    /// Rebuild a run from its newest usable checkpoint. `spec` must compile
    /// to the graph the checkpoint was taken under.
    pub fn recover(id: RunId, spec: WorkflowSpec, deps: RunDeps) -> Result<Self> {
        let recovered = deps
            .checkpoints
            .recover_latest(&id)?
            .ok_or_else(|| SwarmError::RunNotFound(id.to_string()))?;
        let checkpoint = recovered.checkpoint;
        let graph = Arc::new(GraphBuilder::compile(&spec)?);
        if checkpoint.graph_id != graph.id {
            return Err(SwarmError::SpecValidation(format!(
                "run {} was checkpointed under graph {}, spec compiles to {}",
                id,
                &checkpoint.graph_id[..checkpoint.graph_id.len().min(12)],
                graph.short_id()
            )));
        }

        let finished = checkpoint
            .state
            .control
            .cursor
            .as_deref()
            .and_then(|c| graph.step(c))
            .map(Step::is_terminal)
            .unwrap_or(false);
        let handle = Arc::new(RunHandle::new(
            id,
            checkpoint.state,
            spec.revision,
            deps.events.clone(),
        ));
        let run = Self::assemble(handle, spec, graph, deps);
        if let Some(from) = checkpoint.migrated_from {
            run.handle.trace.record(TraceKind::StateMigrated {
                from,
                to: run.graph.schema_version,
            });
        }
        run.handle.trace.record(TraceKind::Resumed {
            action: "recover".to_string(),
        });
        if finished {
            run.handle.transition(RunStatus::Completed)?;
        }
        info!(
            run_id = %run.handle.id,
            sequence = checkpoint.sequence,
            skipped = ?recovered.skipped,
            "Run recovered"
        );
        Ok(run)
    }

    fn assemble(handle: Arc<RunHandle>, spec: WorkflowSpec, graph: Arc<CompiledGraph>, deps: RunDeps) -> Self {
        let gateway = Arc::new(PermissionGateway::new(
            handle.id.clone(),
            handle.store.clone(),
            handle.trace.clone(),
            deps.broker.clone(),
            deps.settings.approval_timeout,
        ));
        Self {
            handle,
            revisions: vec![(spec.clone(), graph.clone())],
            spec,
            graph,
            gateway,
            deps,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.handle.id
    }

    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }

    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    pub fn status(&self) -> RunStatus {
        self.handle.status()
    }

    /// Advance until the run completes, fails, pauses or hits an interrupt.
    pub async fn drive(&mut self) -> Result<RunStatus> {
        self.handle.transition(RunStatus::Running)?;
        loop {
            match self.step_once().await {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Halt(status)) => return Ok(status),
                Err(SwarmError::Cancelled) => {
                    self.handle.fail("cancelled")?;
                    return Ok(RunStatus::Failed);
                }
                Err(e) => {
                    self.handle.fail(&e.to_string())?;
                    return Ok(RunStatus::Failed);
                }
            }
        }
    }

    async fn step_once(&mut self) -> Result<Flow> {
        if self.handle.is_cancelled() {
            return Err(SwarmError::Cancelled);
        }
        if self.handle.swap.is_stale() {
            self.apply_pending_swap()?;
        }

        let state = self.handle.store.snapshot()?;
        let cursor = state.control.cursor.clone();
        if self.handle.pause_requested.swap(false, Ordering::SeqCst)
            || !state.control.flag(ControlFlag::Continue)
        {
            info!(run_id = %self.handle.id, cursor = ?cursor, "Run paused");
            return self
                .handle
                .halt(RunStatus::Paused, TraceKind::Paused { cursor })
                .map(Flow::Halt);
        }

        let cursor = cursor.ok_or_else(|| SwarmError::at_node("<none>", "run has no cursor"))?;
        if state.control.flag(ControlFlag::Interrupt) {
            info!(run_id = %self.handle.id, step = %cursor, "Run interrupted");
            return self
                .handle
                .halt(RunStatus::AwaitingInterrupt, TraceKind::Interrupted { step: cursor })
                .map(Flow::Halt);
        }

        let step = self
            .graph
            .step(&cursor)
            .cloned()
            .ok_or_else(|| SwarmError::at_node(cursor.as_str(), "cursor is not in the active graph"))?;
        if step.is_terminal() {
            info!(run_id = %self.handle.id, graph = %self.graph.short_id(), "Run completed");
            return self
                .handle
                .halt(RunStatus::Completed, TraceKind::Completed)
                .map(Flow::Halt);
        }
        if step.kind == StepKind::InterruptGate && !self.handle.gate_released(&step.id) {
            info!(run_id = %self.handle.id, step = %step.id, "Awaiting approval at gate");
            return self
                .handle
                .halt(RunStatus::AwaitingInterrupt, TraceKind::Interrupted { step: step.id })
                .map(Flow::Halt);
        }
        let limit = self.deps.settings.max_step_visits;
        if state.completions(&step.id) >= limit {
            return Err(SwarmError::VisitLimitExceeded {
                step: step.id,
                limit: limit as usize,
            });
        }

        self.dispatch(&step, Arc::new(state)).await?;
        Ok(Flow::Continue)
    }

    /// Execute, apply, route and checkpoint one step.
    async fn dispatch(&self, step: &Step, view: Arc<ExecutionState>) -> Result<()> {
        let (mut patch, outcome) = match step.kind {
            StepKind::Agent => self.run_agent(step, view).await?,
            _ => {
                self.handle.trace.record(TraceKind::StepStarted {
                    step: step.id.clone(),
                    attempt: 0,
                });
                (control::execute(&self.graph, step, &view)?, StepOutcome::Succeeded)
            }
        };

        patch.completed_steps.push(step.id.clone());
        patch.control.last_step = Some(step.id.clone());
        patch.control.last_outcome = Some(outcome);
        let state = self.handle.store.apply(patch)?;
        self.handle.trace.record(TraceKind::StepCompleted {
            step: step.id.clone(),
            outcome,
        });
        if step.kind == StepKind::InterruptGate {
            self.handle.set_released_gate(None);
        }

        let next = self
            .graph
            .route(&step.id, &state)?
            .ok_or_else(|| SwarmError::NoRoute(step.id.clone()))?;
        let state = self.handle.store.set_cursor(Some(next.clone()))?;
        debug!(run_id = %self.handle.id, from = %step.id, to = %next, "Routed");
        self.handle.trace.record(TraceKind::Routed {
            from: step.id.clone(),
            to: next,
        });
        self.save(&state)?;
        Ok(())
    }

    /// Run an agent step with retries. A permission denial is not a failure:
    /// it yields the capability ledger and a `Denied` outcome.
    async fn run_agent(&self, step: &Step, view: Arc<ExecutionState>) -> Result<(StatePatch, StepOutcome)> {
        let participant = step
            .participant
            .clone()
            .ok_or_else(|| SwarmError::at_node(step.id.as_str(), "agent step without participant"))?;
        let declared = self.spec.participant(&participant);
        let role = declared.map(|p| p.role.clone()).unwrap_or_default();
        let task = step
            .task
            .clone()
            .or_else(|| declared.map(|p| p.task_key().to_string()))
            .unwrap_or_else(|| participant.clone());
        let handler = self.deps.handlers.resolve(&participant, &role)?;
        let policy = step
            .retry
            .clone()
            .unwrap_or_else(|| self.deps.settings.default_retry.clone());

        let mut attempt = 0u32;
        loop {
            self.handle.trace.record(TraceKind::StepStarted {
                step: step.id.clone(),
                attempt,
            });
            let client = Arc::new(CapabilityClient::new(
                participant.clone(),
                self.gateway.clone(),
                self.deps.invoker.clone(),
            ));
            let ctx = StepContext {
                run_id: self.handle.id.clone(),
                step_id: step.id.clone(),
                participant: participant.clone(),
                role: role.clone(),
                task: task.clone(),
                attempt,
                view: view.clone(),
                capabilities: client.clone(),
            };

            let result = match self.deps.settings.cancel_mode {
                CancelMode::Abandon => {
                    tokio::select! {
                        biased;
                        _ = self.handle.cancel.cancelled() => {
                            warn!(run_id = %self.handle.id, step = %step.id, "Abandoning in-flight step");
                            return Err(SwarmError::Cancelled);
                        }
                        r = handler.execute(ctx) => r,
                    }
                }
                CancelMode::Complete => handler.execute(ctx).await,
            }
            .and_then(|patch| patch.validate().map(|_| patch));

            match result {
                Ok(mut patch) => {
                    sanitize(&mut patch);
                    absorb_ledger(&mut patch, client.take_ledger());
                    return Ok((patch, StepOutcome::Succeeded));
                }
                Err(e) if retry::is_denial(&e) => {
                    info!(run_id = %self.handle.id, step = %step.id, error = %e, "Step denied");
                    return Ok((client.take_ledger(), StepOutcome::Denied));
                }
                Err(e) if retry::should_retry(&policy, attempt, &e) => {
                    let delay = retry::backoff(&policy, attempt);
                    warn!(
                        run_id = %self.handle.id,
                        step = %step.id,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    self.handle.trace.record(TraceKind::StepRetried {
                        step: step.id.clone(),
                        attempt,
                        backoff_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.handle.trace.record(TraceKind::StepFailed {
                        step: step.id.clone(),
                        error: e.to_string(),
                    });
                    return Err(match e {
                        e @ SwarmError::StepExecution { .. } => e,
                        other => SwarmError::StepExecution {
                            step: step.id.clone(),
                            message: other.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Apply a queued revision. A revision that does not compile or migrate
    /// is dropped and the run carries on under the current graph.
    fn apply_pending_swap(&mut self) -> Result<()> {
        let Some(spec) = self.handle.swap.take() else {
            self.handle.swap.abort();
            return Ok(());
        };
        let revision = spec.revision;
        let next = match GraphBuilder::compile(&spec) {
            Ok(graph) => graph,
            Err(e) => return self.abort_swap(revision, e),
        };

        let before = self.handle.store.snapshot()?;
        let cursor_before = before.control.cursor.clone();
        let migration = match hotswap::migrate_state(
            before,
            &self.graph,
            &next,
            &spec,
            self.spec.revision,
            &self.deps.migrations,
            Utc::now(),
        ) {
            Ok(m) => m,
            Err(e) => return self.abort_swap(revision, e),
        };

        let mut state = migration.state;
        let (cursor, remap) = hotswap::remap_cursor(&self.graph, &next, &state);
        state.control.cursor = Some(cursor.clone());
        self.handle.store.replace(state.clone())?;

        if let Some(from) = migration.schema_from {
            self.handle.trace.record(TraceKind::StateMigrated {
                from,
                to: next.schema_version,
            });
        }
        hotswap::log_applied(
            self.handle.id.as_str(),
            &self.graph,
            &next,
            &remap,
            migration.archived.len(),
        );
        self.handle.trace.record(TraceKind::HotSwapApplied {
            from_graph: self.graph.id.clone(),
            to_graph: next.id.clone(),
            cursor_before,
            cursor_after: Some(cursor),
            remap,
            archived: migration.archived,
        });

        let next = Arc::new(next);
        if !self.revisions.iter().any(|(_, g)| g.id == next.id) {
            self.revisions.push((spec.clone(), next.clone()));
        }
        self.graph = next;
        self.spec = spec;
        self.handle.swap.mark_applied(revision);
        self.save(&state)
    }

    fn abort_swap(&self, revision: u64, error: SwarmError) -> Result<()> {
        warn!(run_id = %self.handle.id, revision, error = %error, "Hot swap rejected");
        self.handle.swap.abort();
        self.handle.trace.record(TraceKind::HotSwapAborted {
            revision,
            reason: error.to_string(),
        });
        Ok(())
    }

    /// Resume a paused or interrupted run. The run still has to be driven.
    pub fn resume(&self, action: ResumeAction) -> Result<()> {
        let status = self.status();
        if !matches!(status, RunStatus::Paused | RunStatus::AwaitingInterrupt) {
            return Err(SwarmError::InvalidTransition {
                from: status.to_string(),
                to: RunStatus::Ready.to_string(),
            });
        }
        let label = action.label().to_string();
        let modification = match action {
            ResumeAction::Abort { reason } => {
                self.handle.trace.record(TraceKind::Resumed { action: label });
                self.handle.cancel.cancel();
                return self.handle.fail(&format!("aborted: {}", reason));
            }
            ResumeAction::Continue => None,
            ResumeAction::ModifyThenContinue { mut patch } => {
                sanitize(&mut patch);
                Some(patch)
            }
        };

        if let Some(patch) = modification {
            self.handle.store.apply(patch)?;
        }
        let state = self.handle.store.snapshot()?;
        let mut release = StatePatch::new();
        if state.control.flag(ControlFlag::Interrupt) {
            release = release.with_flag(ControlFlag::Interrupt, false);
        }
        if !state.control.flag(ControlFlag::Continue) {
            release = release.with_flag(ControlFlag::Continue, true);
        }
        let state = if release.is_empty() {
            state
        } else {
            self.handle.store.apply(release)?
        };
        if status == RunStatus::AwaitingInterrupt {
            self.handle.set_released_gate(state.control.cursor.clone());
        }
        self.handle.pause_requested.store(false, Ordering::SeqCst);
        self.save(&state)?;
        self.handle.trace.record(TraceKind::Resumed {
            action: label.clone(),
        });
        info!(run_id = %self.handle.id, action = %label, "Run resumed");
        self.handle.transition(RunStatus::Ready)
    }

    /// Restore the state of checkpoint `sequence` and record it as a new
    /// checkpoint. Only an idle, unfinished run can be rolled back.
    pub fn rollback(&mut self, sequence: u64) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            RunStatus::Ready | RunStatus::Paused | RunStatus::AwaitingInterrupt
        ) {
            return Err(SwarmError::InvalidTransition {
                from: status.to_string(),
                to: RunStatus::Ready.to_string(),
            });
        }
        let checkpoint = self.deps.checkpoints.load_at(&self.handle.id, sequence)?;
        let (spec, graph) = self
            .revisions
            .iter()
            .find(|(_, g)| g.id == checkpoint.graph_id)
            .cloned()
            .ok_or_else(|| SwarmError::GraphValidation {
                node: None,
                edge: None,
                reason: format!(
                    "checkpoint #{} belongs to graph {} which this run never used",
                    sequence, checkpoint.graph_id
                ),
            })?;

        self.handle.store.replace(checkpoint.state.clone())?;
        self.handle.set_released_gate(None);
        self.handle.pause_requested.store(false, Ordering::SeqCst);
        if graph.id != self.graph.id {
            self.spec = spec;
            self.graph = graph;
        }
        self.handle.trace.record(TraceKind::RolledBack { sequence });
        warn!(run_id = %self.handle.id, sequence, "Run rolled back");
        self.save(&checkpoint.state)?;
        self.handle.transition(RunStatus::Ready)
    }

    fn checkpoint(&self) -> Result<()> {
        let state = self.handle.store.snapshot()?;
        self.save(&state)
    }

    fn save(&self, state: &ExecutionState) -> Result<()> {
        let checkpoint = self
            .deps
            .checkpoints
            .save(&self.handle.id, state, &self.graph.id)?;
        self.handle.trace.record(TraceKind::Checkpointed {
            sequence: checkpoint.sequence,
        });
        Ok(())
    }
}

/// Handlers may not steer routing directly.
fn sanitize(patch: &mut StatePatch) {
    patch.control.cursor = None;
    patch.control.last_step = None;
    patch.control.last_outcome = None;
    patch.completed_steps.clear();
}

fn absorb_ledger(patch: &mut StatePatch, ledger: StatePatch) {
    patch.capability_requests.extend(ledger.capability_requests);
    patch.capability_results.extend(ledger.capability_results);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use RunStatus::*;
        assert!(transition_allowed(Ready, Running));
        assert!(transition_allowed(Running, AwaitingInterrupt));
        assert!(transition_allowed(AwaitingInterrupt, Ready));
        assert!(!transition_allowed(Completed, Running));
        assert!(!transition_allowed(Failed, Ready));
        assert!(!transition_allowed(Paused, Running));
        assert!(!transition_allowed(Running, Ready));
    }

    #[test]
    fn sanitize_strips_routing() {
        let mut patch = StatePatch::new().with_progress("t", 10.0);
        patch.control.cursor = Some("x".into());
        patch.control.last_outcome = Some(StepOutcome::Denied);
        patch.completed_steps.push("x".into());
        sanitize(&mut patch);
        assert_eq!(patch, StatePatch::new().with_progress("t", 10.0));
    }

    #[test]
    fn settings_from_config() {
        let config: AppConfig = toml::from_str(
            "[engine]\nmax_step_visits = 4\ncancel_mode = \"abandon\"\n[gateway]\napproval_timeout_secs = 3\n[permissions.w]\nread = \"allow\"\n",
        )
        .unwrap();
        let settings = RunSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_step_visits, 4);
        assert_eq!(settings.cancel_mode, CancelMode::Abandon);
        assert_eq!(settings.approval_timeout, Duration::from_secs(3));
        assert_eq!(settings.permissions.get("w", "read"), Some(&PermissionRule::Allow));
    }

    #[test]
    fn handle_status_changes_are_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let handle = RunHandle::new(RunId::from_string("r"), ExecutionState::new(), 1, bus);
        handle.request_pause().unwrap();
        assert_eq!(handle.status(), RunStatus::Paused);
        assert!(handle.request_pause().is_err());
        match rx.try_recv().unwrap() {
            RunEvent::StatusChanged { from, to, .. } => {
                assert_eq!(from, RunStatus::Ready);
                assert_eq!(to, RunStatus::Paused);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        handle.cancel().unwrap();
        assert_eq!(handle.status(), RunStatus::Failed);
        assert_eq!(handle.failure().as_deref(), Some("cancelled"));
        assert!(handle.cancel().is_err());
    }
}
