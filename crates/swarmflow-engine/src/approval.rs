//! Human sign-off for capabilities whose permission rule is `approval`.
//!
//! The gateway parks the calling step in [`ApprovalBroker::decide`] until an
//! operator answers through [`ApprovalBroker::respond`] or the configured
//! timeout passes. Each wait is announced on the event bus so a UI or CLI
//! can list it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use swarmflow_core::event::EventBus;
use swarmflow_core::permission::{ApprovalDecision, ApprovalRequest};
use swarmflow_core::types::RunEvent;

struct Waiting {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// Capability calls waiting on an operator, keyed by request id.
pub struct ApprovalBroker {
    waiting: Mutex<HashMap<String, Waiting>>,
    events: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Park a capability call until it is answered. `None` means nobody
    /// answered within `timeout`; the request is withdrawn in that case.
    pub async fn decide(&self, request: ApprovalRequest, timeout: Duration) -> Option<ApprovalDecision> {
        let (reply, answer) = oneshot::channel();
        let id = request.id.clone();
        self.events.publish(RunEvent::ApprovalRequested {
            request: request.clone(),
        });
        self.waiting
            .lock()
            .await
            .insert(id.clone(), Waiting { request, reply });

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => Some(ApprovalDecision::Denied {
                reason: "approval withdrawn".into(),
            }),
            Err(_) => {
                self.waiting.lock().await.remove(&id);
                debug!(request_id = %id, "Approval request expired");
                None
            }
        }
    }

    /// Answer a waiting call by its full id or by a prefix that matches
    /// exactly one request. False when nothing matched.
    pub async fn respond(&self, id_or_prefix: &str, decision: ApprovalDecision) -> bool {
        let entry = {
            let mut waiting = self.waiting.lock().await;
            let id = if waiting.contains_key(id_or_prefix) {
                Some(id_or_prefix.to_string())
            } else {
                let mut hits = waiting.keys().filter(|k| k.starts_with(id_or_prefix));
                match (hits.next(), hits.next()) {
                    (Some(only), None) => Some(only.clone()),
                    _ => None,
                }
            };
            id.and_then(|id| waiting.remove(&id))
        };
        let Some(Waiting { request, reply }) = entry else {
            return false;
        };

        self.events.publish(RunEvent::ApprovalResolved {
            request_id: request.id.clone(),
            approved: matches!(decision, ApprovalDecision::Approved),
        });
        // The step may have timed out between lookup and send.
        let _ = reply.send(decision);
        true
    }

    /// Waiting requests, oldest first.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .waiting
            .lock()
            .await
            .values()
            .map(|w| w.request.clone())
            .collect();
        requests.sort_by_key(|r| r.timestamp);
        requests
    }
}
