use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use swarmflow_core::error::Result;
use swarmflow_core::patch::StatePatch;
use swarmflow_core::traits::{CapabilityInvoker, StepContext, StepHandler};

/// Stand-in participant for dry runs from the command line.
///
/// Calls every capability it was given, then reports what it saw: the number
/// of upstream outputs and each capability result. It approves every vote.
pub struct EchoHandler {
    capabilities: Vec<String>,
}

impl EchoHandler {
    pub fn new(capabilities: Vec<String>) -> Self {
        Self { capabilities }
    }
}

impl StepHandler for EchoHandler {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
        Box::pin(async move {
            let mut results = serde_json::Map::new();
            for capability in &self.capabilities {
                let params = json!({ "step": ctx.step_id, "attempt": ctx.attempt });
                let value = ctx
                    .capabilities
                    .invoke(capability.clone(), params)
                    .await
                    .map_err(|e| {
                        warn!(step = %ctx.step_id, capability, error = %e, "Capability call failed");
                        e
                    })?;
                results.insert(capability.clone(), value);
            }
            debug!(step = %ctx.step_id, participant = %ctx.participant, "Echo step");
            Ok(StatePatch::new()
                .with_message(
                    ctx.participant.clone(),
                    format!("{} ({}) finished {}", ctx.participant, ctx.role, ctx.task),
                )
                .with_output(
                    ctx.step_id.clone(),
                    json!({
                        "participant": ctx.participant,
                        "role": ctx.role,
                        "seen_outputs": ctx.view.outputs.len(),
                        "capabilities": Value::Object(results),
                        "vote": "approve",
                    }),
                )
                .with_progress(ctx.task.clone(), 100.0))
        })
    }
}

/// Capability backend for dry runs: answers every call with its own input.
pub struct EchoInvoker;

impl CapabilityInvoker for EchoInvoker {
    fn invoke(&self, capability: String, params: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(json!({ "capability": capability, "params": params })) })
    }
}
