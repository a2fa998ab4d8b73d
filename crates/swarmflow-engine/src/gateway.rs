use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::patch::StatePatch;
use swarmflow_core::permission::{ApprovalDecision, ApprovalRequest, Decision, PermissionRule};
use swarmflow_core::state::{CapabilityCall, ExecutionState};
use swarmflow_core::traits::CapabilityInvoker;
use swarmflow_core::types::{RunId, TraceKind};

use crate::approval::ApprovalBroker;
use crate::store::{take_quota, StateStore};
use crate::trace::TraceBook;

/// Resolve a matrix entry against the state. Unlisted pairs are denied.
pub fn check(state: &ExecutionState, participant: &str, capability: &str) -> Decision {
    check_at(state, participant, capability, Utc::now())
}

pub fn check_at(
    state: &ExecutionState,
    participant: &str,
    capability: &str,
    now: DateTime<Utc>,
) -> Decision {
    match state.permissions.get(participant, capability) {
        None | Some(PermissionRule::Deny) => Decision::Deny,
        Some(PermissionRule::Allow) => Decision::Allow,
        Some(PermissionRule::Approval) => Decision::NeedsApproval,
        Some(PermissionRule::Quota { limit }) => {
            let remaining = state
                .quota_remaining(participant, capability)
                .unwrap_or(*limit);
            if remaining > 0 {
                Decision::Allow
            } else {
                Decision::Deny
            }
        }
        Some(PermissionRule::Conditional {
            condition,
            otherwise,
        }) => {
            if condition.evaluate(state, participant, capability, now) {
                Decision::Allow
            } else {
                *otherwise
            }
        }
    }
}

/// Permission Gateway for one run.
///
/// Decisions are taken under the state lock; a quota is decremented in the
/// same critical section that grants it.
pub struct PermissionGateway {
    run_id: RunId,
    store: Arc<StateStore>,
    trace: Arc<TraceBook>,
    broker: Arc<ApprovalBroker>,
    approval_timeout: Duration,
}

impl PermissionGateway {
    pub fn new(
        run_id: RunId,
        store: Arc<StateStore>,
        trace: Arc<TraceBook>,
        broker: Arc<ApprovalBroker>,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            run_id,
            store,
            trace,
            broker,
            approval_timeout,
        }
    }

    /// Decide without side effects.
    pub fn check(&self, participant: &str, capability: &str) -> Result<Decision> {
        self.store
            .with_lock(|state| check(state, participant, capability))
    }

    /// Decide, consume quota, and wait for approval when required.
    ///
    /// Returns `PermissionDenied` for a denial (including a denied approval)
    /// and `ApprovalTimeout` when nobody answered in time.
    pub async fn authorize(&self, participant: &str, capability: &str, params: &Value) -> Result<()> {
        let now = Utc::now();
        let (decision, consumed) = self.store.with_lock(|state| {
            let decision = check_at(state, participant, capability, now);
            let limit = match state.permissions.get(participant, capability) {
                Some(PermissionRule::Quota { limit }) => Some(*limit),
                _ => None,
            };
            match (decision, limit) {
                (Decision::Allow, Some(limit)) => match take_quota(state, participant, capability, limit) {
                    Some(remaining) => (Decision::Allow, Some(remaining)),
                    None => (Decision::Deny, None),
                },
                (decision, _) => (decision, None),
            }
        })?;

        match decision {
            Decision::Allow => {
                if let Some(remaining) = consumed {
                    self.trace.record(TraceKind::QuotaConsumed {
                        participant: participant.to_string(),
                        capability: capability.to_string(),
                        remaining,
                    });
                }
                debug!(run_id = %self.run_id, participant, capability, "Capability allowed");
                Ok(())
            }
            Decision::Deny => Err(self.deny(participant, capability)),
            Decision::NeedsApproval => self.await_approval(participant, capability, params).await,
        }
    }

    async fn await_approval(&self, participant: &str, capability: &str, params: &Value) -> Result<()> {
        self.trace.record(TraceKind::ApprovalRequired {
            participant: participant.to_string(),
            capability: capability.to_string(),
        });
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            participant: participant.to_string(),
            capability: capability.to_string(),
            params_summary: summarize_params(params),
            timestamp: Utc::now(),
        };
        match self.broker.decide(request, self.approval_timeout).await {
            Some(ApprovalDecision::Approved) => {
                debug!(run_id = %self.run_id, participant, capability, "Capability approved");
                Ok(())
            }
            Some(ApprovalDecision::Denied { reason }) => {
                warn!(run_id = %self.run_id, participant, capability, reason = %reason, "Approval denied");
                Err(self.deny(participant, capability))
            }
            None => {
                warn!(
                    run_id = %self.run_id,
                    participant,
                    capability,
                    timeout_ms = self.approval_timeout.as_millis() as u64,
                    "Approval timed out"
                );
                Err(SwarmError::ApprovalTimeout {
                    capability: capability.to_string(),
                })
            }
        }
    }

    fn deny(&self, participant: &str, capability: &str) -> SwarmError {
        self.trace.record(TraceKind::PermissionDenied {
            participant: participant.to_string(),
            capability: capability.to_string(),
        });
        warn!(run_id = %self.run_id, participant, capability, "Capability denied");
        SwarmError::PermissionDenied {
            participant: participant.to_string(),
            capability: capability.to_string(),
        }
    }
}

/// Short single-line rendering of call parameters for approval prompts.
fn summarize_params(params: &Value) -> String {
    let text = params.to_string();
    if text.chars().count() > 120 {
        let head: String = text.chars().take(117).collect();
        format!("{}...", head)
    } else {
        text
    }
}

/// Capability access handed to one step: every call goes through the
/// gateway, and requests and results are recorded for the step's patch.
pub struct CapabilityClient {
    participant: String,
    gateway: Arc<PermissionGateway>,
    inner: Arc<dyn CapabilityInvoker>,
    ledger: Mutex<StatePatch>,
}

impl CapabilityClient {
    pub fn new(
        participant: impl Into<String>,
        gateway: Arc<PermissionGateway>,
        inner: Arc<dyn CapabilityInvoker>,
    ) -> Self {
        Self {
            participant: participant.into(),
            gateway,
            inner,
            ledger: Mutex::new(StatePatch::new()),
        }
    }

    /// Drain the recorded capability traffic into a patch.
    pub fn take_ledger(&self) -> StatePatch {
        self.ledger
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut StatePatch)) {
        if let Ok(mut ledger) = self.ledger.lock() {
            f(&mut ledger);
        }
    }

    async fn call(&self, capability: String, params: Value) -> Result<Value> {
        self.gateway
            .authorize(&self.participant, &capability, &params)
            .await?;

        let call_id = Uuid::new_v4().to_string();
        self.record(|patch| {
            patch.capability_requests.push(CapabilityCall {
                id: call_id.clone(),
                participant: self.participant.clone(),
                capability: capability.clone(),
                params: params.clone(),
                requested_at: Utc::now(),
            })
        });

        let result = self.inner.invoke(capability.clone(), params).await;
        let recorded = match &result {
            Ok(value) => value.clone(),
            Err(e) => json!({ "error": e.to_string() }),
        };
        self.record(|patch| {
            *patch = std::mem::take(patch).with_capability_result(Some(call_id), &capability, recorded)
        });
        result
    }
}

impl CapabilityInvoker for CapabilityClient {
    fn invoke(&self, capability: String, params: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.call(capability, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmflow_core::event::EventBus;
    use swarmflow_core::permission::{Condition, PermissionMatrix};
    use swarmflow_core::state::ControlFlag;

    struct Echo;

    impl CapabilityInvoker for Echo {
        fn invoke(&self, capability: String, params: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Ok(json!({ "capability": capability, "params": params })) })
        }
    }

    fn gateway(matrix: PermissionMatrix, timeout_ms: u64) -> (Arc<PermissionGateway>, Arc<StateStore>, Arc<TraceBook>, Arc<ApprovalBroker>) {
        let bus = Arc::new(EventBus::default());
        let run_id = RunId::from_string("run");
        let store = Arc::new(StateStore::new(ExecutionState::new().with_permissions(matrix)));
        let trace = Arc::new(TraceBook::new(run_id.clone(), bus.clone()));
        let broker = Arc::new(ApprovalBroker::new(bus));
        let gw = Arc::new(PermissionGateway::new(
            run_id,
            store.clone(),
            trace.clone(),
            broker.clone(),
            Duration::from_millis(timeout_ms),
        ));
        (gw, store, trace, broker)
    }

    #[test]
    fn static_and_conditional_entries() {
        let matrix = PermissionMatrix::new()
            .with_rule("w", "read", PermissionRule::Allow)
            .with_rule("w", "rm", PermissionRule::Deny)
            .with_rule("w", "publish", PermissionRule::Approval)
            .with_rule(
                "w",
                "deploy",
                PermissionRule::Conditional {
                    condition: Condition::FlagSet {
                        flag: ControlFlag::Approval,
                    },
                    otherwise: Decision::NeedsApproval,
                },
            );
        let mut state = ExecutionState::new().with_permissions(matrix);
        assert_eq!(check(&state, "w", "read"), Decision::Allow);
        assert_eq!(check(&state, "w", "rm"), Decision::Deny);
        assert_eq!(check(&state, "w", "unknown"), Decision::Deny);
        assert_eq!(check(&state, "nobody", "read"), Decision::Deny);
        assert_eq!(check(&state, "w", "publish"), Decision::NeedsApproval);
        assert_eq!(check(&state, "w", "deploy"), Decision::NeedsApproval);

        state.control.requires_approval.value = true;
        assert_eq!(check(&state, "w", "deploy"), Decision::Allow);
    }

    #[tokio::test]
    async fn quota_is_consumed_with_the_grant() {
        let matrix = PermissionMatrix::new().with_rule("w", "search", PermissionRule::Quota { limit: 2 });
        let (gw, store, trace, _) = gateway(matrix, 50);
        gw.authorize("w", "search", &json!({})).await.unwrap();
        gw.authorize("w", "search", &json!({})).await.unwrap();
        let err = gw.authorize("w", "search", &json!({})).await.unwrap_err();
        assert!(matches!(err, SwarmError::PermissionDenied { .. }));

        let state = store.snapshot().unwrap();
        assert_eq!(state.quota_remaining("w", "search"), Some(0));
        let kinds: Vec<_> = trace.records().into_iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds[1],
            TraceKind::QuotaConsumed {
                participant: "w".into(),
                capability: "search".into(),
                remaining: 0
            }
        );
        assert!(matches!(kinds[2], TraceKind::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn concurrent_quota_never_overdraws() {
        let matrix = PermissionMatrix::new().with_rule("w", "search", PermissionRule::Quota { limit: 3 });
        let (gw, _, _, _) = gateway(matrix, 50);
        let calls = (0..10).map(|_| {
            let gw = gw.clone();
            tokio::spawn(async move { gw.authorize("w", "search", &Value::Null).await.is_ok() })
        });
        let granted = futures::future::join_all(calls)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn approval_granted_and_timed_out() {
        let matrix = PermissionMatrix::new().with_rule("w", "publish", PermissionRule::Approval);
        let (gw, _, trace, broker) = gateway(matrix, 2_000);

        let waiter = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.authorize("w", "publish", &json!({"doc": 1})).await })
        };
        let id = loop {
            if let Some(req) = broker.pending_requests().await.first() {
                break req.id.clone();
            }
            tokio::task::yield_now().await;
        };
        broker.respond(&id, ApprovalDecision::Approved).await;
        assert!(waiter.await.unwrap().is_ok());
        assert!(matches!(trace.records()[0].kind, TraceKind::ApprovalRequired { .. }));

        let matrix = PermissionMatrix::new().with_rule("w", "publish", PermissionRule::Approval);
        let (gw, _, _, broker) = gateway(matrix, 20);
        let err = gw.authorize("w", "publish", &Value::Null).await.unwrap_err();
        assert!(matches!(err, SwarmError::ApprovalTimeout { .. }));
        assert!(broker.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn client_records_requests_and_results() {
        let matrix = PermissionMatrix::new().with_rule("w", "read", PermissionRule::Allow);
        let (gw, _, _, _) = gateway(matrix, 50);
        let client = CapabilityClient::new("w", gw, Arc::new(Echo));

        let out = client.invoke("read".into(), json!({"path": "a"})).await.unwrap();
        assert_eq!(out["capability"], json!("read"));
        assert!(client.invoke("write".into(), Value::Null).await.is_err());

        let ledger = client.take_ledger();
        assert_eq!(ledger.capability_requests.len(), 1);
        assert_eq!(ledger.capability_results.len(), 1);
        assert_eq!(
            ledger.capability_results[0].call_id.as_deref(),
            Some(ledger.capability_requests[0].id.as_str())
        );
        assert!(client.take_ledger().is_empty());
    }

    #[test]
    fn long_params_are_truncated() {
        let long = json!({ "text": "x".repeat(500) });
        let summary = summarize_params(&long);
        assert_eq!(summary.chars().count(), 120);
        assert!(summary.ends_with("..."));
    }
}
