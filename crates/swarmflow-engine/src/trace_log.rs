use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use swarmflow_core::types::{RunEvent, RunId, TraceKind};

/// JSONL execution log for one run.
///
/// Writes `{log_dir}/{run_id}/{timestamp}.jsonl`, one object per line,
/// flushed after every line so a crash loses nothing already written.
pub struct TraceLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl TraceLogger {
    /// `level`: 1 = run summary, 2 = per step, 3 = routing and permission
    /// detail.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Consume events for `run_id` until the run finishes or `cancel` fires.
    ///
    /// Takes an already-subscribed receiver so nothing published between
    /// spawning and the first poll is missed.
    pub async fn run(self, mut rx: Receiver<RunEvent>, run_id: RunId, cancel: CancellationToken) {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };
        info!(path = %log_path.display(), "TraceLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("TraceLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if event.run_id() != Some(&run_id) {
                            continue;
                        }
                        if let Some(entry) = self.event_to_entry(&event) {
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        if matches!(event, RunEvent::StatusChanged { to, .. } if to.is_terminal()) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "TraceLogger lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("EventBus closed, TraceLogger stopping");
                        break;
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "TraceLogger finished");
    }

    /// Map an event to a line, or `None` when the level filters it out.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |run_id: &RunId, event_type: &str, index: Option<u64>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            index,
            detail,
        };

        match event {
            RunEvent::StatusChanged { run_id, from, to } => Some(entry(
                run_id,
                "status_changed",
                None,
                Some(serde_json::json!({ "from": from, "to": to })),
            )),
            RunEvent::Trace(record) => {
                if self.level < trace_level(&record.kind) {
                    return None;
                }
                let mut detail = serde_json::to_value(&record.kind).ok()?;
                let event_type = detail
                    .as_object_mut()
                    .and_then(|m| m.remove("type"))
                    .and_then(|t| t.as_str().map(str::to_string))
                    .unwrap_or_else(|| "trace".to_string());
                let detail = match detail {
                    serde_json::Value::Object(m) if m.is_empty() => None,
                    other => Some(other),
                };
                Some(entry(&record.run_id, &event_type, Some(record.index), detail))
            }
            RunEvent::ApprovalRequested { request } if self.level >= 3 => Some(entry(
                &request.run_id,
                "approval_requested",
                None,
                Some(serde_json::json!({
                    "request_id": request.id,
                    "participant": request.participant,
                    "capability": request.capability,
                    "params": request.params_summary,
                })),
            )),
            _ => None,
        }
    }
}

/// Minimum log level at which a trace record is written.
fn trace_level(kind: &TraceKind) -> u8 {
    match kind {
        TraceKind::RunStarted { .. }
        | TraceKind::Completed
        | TraceKind::Failed { .. }
        | TraceKind::HotSwapApplied { .. }
        | TraceKind::HotSwapAborted { .. }
        | TraceKind::RolledBack { .. } => 1,
        TraceKind::StepCompleted { .. }
        | TraceKind::StepFailed { .. }
        | TraceKind::StepRetried { .. }
        | TraceKind::Checkpointed { .. }
        | TraceKind::Interrupted { .. }
        | TraceKind::Paused { .. }
        | TraceKind::Resumed { .. }
        | TraceKind::HotSwapQueued { .. }
        | TraceKind::StateMigrated { .. } => 2,
        TraceKind::StepStarted { .. }
        | TraceKind::Routed { .. }
        | TraceKind::PermissionDenied { .. }
        | TraceKind::ApprovalRequired { .. }
        | TraceKind::QuotaConsumed { .. }
        | TraceKind::PermissionUpdated { .. } => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmflow_core::event::EventBus;
    use swarmflow_core::types::{RunStatus, TraceRecord};

    fn record(kind: TraceKind) -> RunEvent {
        RunEvent::Trace(TraceRecord {
            index: 4,
            run_id: RunId::from_string("r1"),
            timestamp: Utc::now(),
            kind,
        })
    }

    #[test]
    fn level_filtering() {
        let l1 = TraceLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&record(TraceKind::Completed)).is_some());
        assert!(l1
            .event_to_entry(&record(TraceKind::Checkpointed { sequence: 1 }))
            .is_none());

        let l2 = TraceLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2
            .event_to_entry(&record(TraceKind::Checkpointed { sequence: 1 }))
            .is_some());
        assert!(l2
            .event_to_entry(&record(TraceKind::Routed {
                from: "a".into(),
                to: "b".into()
            }))
            .is_none());

        let l3 = TraceLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3
            .event_to_entry(&record(TraceKind::Routed {
                from: "a".into(),
                to: "b".into()
            }))
            .is_some());
    }

    #[test]
    fn entry_shape() {
        let logger = TraceLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger
            .event_to_entry(&record(TraceKind::StepCompleted {
                step: "writer".into(),
                outcome: swarmflow_core::types::StepOutcome::Succeeded,
            }))
            .unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event_type"], "step_completed");
        assert_eq!(json["index"], 4);
        assert_eq!(json["detail"]["step"], "writer");

        let done = logger.event_to_entry(&record(TraceKind::Completed)).unwrap();
        let json = serde_json::to_string(&done).unwrap();
        assert!(!json.contains("detail"));
    }

    #[tokio::test]
    async fn writes_jsonl_until_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let rx = bus.subscribe();
        let run_id = RunId::from_string("r1");
        let task = tokio::spawn(TraceLogger::new(dir.path().to_path_buf(), 2).run(
            rx,
            run_id.clone(),
            CancellationToken::new(),
        ));

        bus.publish(record(TraceKind::RunStarted {
            graph_id: "g".into(),
            entry: "a".into(),
        }));
        bus.publish(RunEvent::Trace(TraceRecord {
            index: 0,
            run_id: RunId::from_string("other"),
            timestamp: Utc::now(),
            kind: TraceKind::Completed,
        }));
        bus.publish(RunEvent::StatusChanged {
            run_id: run_id.clone(),
            from: RunStatus::Running,
            to: RunStatus::Completed,
        });
        task.await.unwrap();

        let run_dir = dir.path().join("r1");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("status_changed"));
    }
}
