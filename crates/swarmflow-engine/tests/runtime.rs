use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use swarmflow_core::error::SwarmError;
use swarmflow_core::permission::ApprovalDecision;
use swarmflow_core::types::{ResumeAction, RunId, RunStatus, TraceKind};
use swarmflow_engine::{HandlerRegistry, WorkflowRuntime};
use swarmflow_test_utils::{
    gated_spec, parallel_spec, sequential_spec, CallLog, CapabilityHandler, MockInvoker,
    ScriptedHandler, TestWorkspace,
};

fn runtime(ws: &TestWorkspace, log: &CallLog) -> WorkflowRuntime {
    let handlers = HandlerRegistry::new()
        .with_role("deployer", Arc::new(CapabilityHandler::new("deploy", json!({"env": "prod"}))))
        .with_default(Arc::new(ScriptedHandler::completing().with_log(log.clone())));
    WorkflowRuntime::from_config(&ws.config, handlers, Arc::new(MockInvoker::new())).unwrap()
}

/// The logger runs on its own task; give it a moment to drain.
async fn read_log(dir: std::path::PathBuf, needle: &str) -> String {
    for _ in 0..100 {
        if let Some(Ok(entry)) = std::fs::read_dir(&dir).ok().and_then(|mut d| d.next()) {
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            if content.contains(needle) {
                return content;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no log line containing {needle} in {}", dir.display());
}

#[tokio::test]
async fn config_driven_run_checkpoints_and_logs() {
    let ws = TestWorkspace::new("sqlite", "");
    let log = CallLog::default();
    let runtime = runtime(&ws, &log);
    assert_eq!(runtime.checkpoints().backend_name(), "sqlite");

    let id = runtime.submit_spec(parallel_spec(&["a", "b", "c"])).await.unwrap();
    assert_eq!(runtime.status(&id).await.unwrap(), RunStatus::Ready);
    assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::Completed);
    assert_eq!(log.entries(), vec!["a", "b", "c"]);

    let checkpoints = runtime.list_checkpoints(&id).unwrap();
    assert_eq!(checkpoints.len(), 9);
    assert!(checkpoints.iter().all(|c| c.intact));
    let changes = runtime.diff(&id, 1, 9).unwrap();
    assert!(changes.iter().any(|c| c.path.starts_with("outputs.a")));

    let trace = runtime.get_trace(&id).await.unwrap();
    assert_eq!(trace.last().unwrap().kind, TraceKind::Completed);
    assert!(trace.windows(2).all(|w| w[0].index + 1 == w[1].index));

    let content = read_log(ws.config.log_dir().join(id.as_str()), "\"to\":\"completed\"").await;
    let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(first["run_id"], id.as_str());
    assert!(content.contains("\"event_type\":\"routed\""));
}

#[tokio::test]
async fn background_run_with_gate_and_approval() {
    let ws = TestWorkspace::new("memory", "");
    let log = CallLog::default();
    let runtime = runtime(&ws, &log);

    let id = runtime.submit_spec(gated_spec(&["a", "b"], "b")).await.unwrap();
    let status = runtime.start(&id).await.unwrap().await.unwrap().unwrap();
    assert_eq!(status, RunStatus::AwaitingInterrupt);

    runtime.resume(&id, ResumeAction::Continue).await.unwrap();
    assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::Completed);
    assert_eq!(log.entries(), vec!["a", "b"]);

    let mut spec = sequential_spec(&["ship"]);
    spec.participants[0].role = "deployer".into();
    spec.participants[0].capabilities.push("deploy".into());
    let ship = runtime.submit_spec(spec).await.unwrap();
    runtime
        .update_permission(&ship, "ship", "deploy", swarmflow_core::permission::PermissionRule::Approval)
        .await
        .unwrap();
    let task = runtime.start(&ship).await.unwrap();

    let pending = loop {
        let pending = runtime.pending_approvals().await;
        if !pending.is_empty() {
            break pending;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(pending[0].participant, "ship");
    let prefix = &pending[0].id[..8];
    assert!(runtime.respond_approval(prefix, ApprovalDecision::Approved).await);
    assert_eq!(task.await.unwrap().unwrap(), RunStatus::Completed);

    let state = runtime.state(&ship).await.unwrap();
    assert_eq!(state.outputs["ship"].current["capability"], "deploy");
}

#[tokio::test]
async fn cancel_and_unknown_runs() {
    let ws = TestWorkspace::new("memory", "");
    let runtime = runtime(&ws, &CallLog::default());

    let id = runtime.submit_spec(sequential_spec(&["a"])).await.unwrap();
    runtime.cancel(&id).await.unwrap();
    assert_eq!(runtime.status(&id).await.unwrap(), RunStatus::Failed);
    assert_eq!(runtime.failure(&id).await.unwrap().as_deref(), Some("cancelled"));
    assert!(runtime.drive(&id).await.is_err());

    let missing = RunId::from_string("missing");
    assert!(matches!(
        runtime.status(&missing).await,
        Err(SwarmError::RunNotFound(_))
    ));
    assert!(!runtime.respond_approval("nope", ApprovalDecision::Approved).await);
    assert_eq!(runtime.run_ids().await, vec![id]);
}

#[tokio::test]
async fn recover_after_restart() {
    let ws = TestWorkspace::new("sqlite", "");
    let spec = gated_spec(&["a", "b"], "b");

    let id = {
        let runtime = runtime(&ws, &CallLog::default());
        let id = runtime.submit_spec(spec.clone()).await.unwrap();
        assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::AwaitingInterrupt);
        id
    };

    let log = CallLog::default();
    let runtime = runtime(&ws, &log);
    assert_eq!(runtime.recover(&id, spec).await.unwrap(), RunStatus::Ready);
    assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::AwaitingInterrupt);
    runtime.resume(&id, ResumeAction::Continue).await.unwrap();
    assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::Completed);
    assert_eq!(log.entries(), vec!["b"]);
}

#[tokio::test]
async fn config_permissions_are_seeded() {
    let ws = TestWorkspace::new("memory", "\n[permissions.ship]\ndeploy = \"deny\"\n");
    let runtime = runtime(&ws, &CallLog::default());

    let mut spec = sequential_spec(&["ship"]);
    spec.participants[0].role = "deployer".into();
    spec.participants[0].capabilities.push("deploy".into());
    let id = runtime.submit_spec(spec).await.unwrap();
    assert_eq!(runtime.drive(&id).await.unwrap(), RunStatus::Completed);

    let trace = runtime.get_trace(&id).await.unwrap();
    assert!(trace
        .iter()
        .any(|r| matches!(&r.kind, TraceKind::PermissionDenied { capability, .. } if capability == "deploy")));
}
