#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use swarmflow_core::event::EventBus;
use swarmflow_core::migration::MigrationRegistry;
use swarmflow_core::traits::{CapabilityInvoker, CheckpointBackend};
use swarmflow_core::types::{RetryPolicy, TraceKind, TraceRecord};
use swarmflow_engine::{ApprovalBroker, HandlerRegistry, RunDeps, RunSettings};
use swarmflow_store::{CheckpointManager, InMemoryBackend};
use swarmflow_test_utils::MockInvoker;

/// Settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> RunSettings {
    RunSettings {
        default_retry: RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        approval_timeout: Duration::from_millis(200),
        ..RunSettings::default()
    }
}

pub fn deps_with(
    handlers: HandlerRegistry,
    invoker: Arc<dyn CapabilityInvoker>,
    backend: Arc<dyn CheckpointBackend>,
    settings: RunSettings,
) -> RunDeps {
    let events = Arc::new(EventBus::default());
    RunDeps {
        checkpoints: Arc::new(CheckpointManager::new(backend)),
        handlers: Arc::new(handlers),
        invoker,
        broker: Arc::new(ApprovalBroker::new(events.clone())),
        events,
        migrations: Arc::new(MigrationRegistry::with_builtin()),
        settings,
    }
}

/// In-memory checkpoints, echoing capabilities, fast retries.
pub fn deps(handlers: HandlerRegistry) -> RunDeps {
    deps_with(
        handlers,
        Arc::new(MockInvoker::new()),
        Arc::new(InMemoryBackend::new()),
        fast_settings(),
    )
}

pub fn kinds(records: &[TraceRecord]) -> Vec<TraceKind> {
    records.iter().map(|r| r.kind.clone()).collect()
}

pub fn count(records: &[TraceRecord], pred: impl Fn(&TraceKind) -> bool) -> usize {
    records.iter().filter(|r| pred(&r.kind)).count()
}

/// Agent and control steps in completion order.
pub fn completed_steps(records: &[TraceRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match &r.kind {
            TraceKind::StepCompleted { step, .. } => Some(step.clone()),
            _ => None,
        })
        .collect()
}
