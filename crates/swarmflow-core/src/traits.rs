use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::patch::StatePatch;
use crate::state::ExecutionState;
use crate::types::RunId;

/// Everything a handler gets for one step invocation.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub step_id: String,
    pub participant: String,
    pub role: String,
    /// Task key the participant reports progress under.
    pub task: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Read-only snapshot taken before the step started.
    pub view: Arc<ExecutionState>,
    /// Capability access, already scoped to this participant and gated.
    pub capabilities: Arc<dyn CapabilityInvoker>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("participant", &self.participant)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Business logic behind an agent step.
pub trait StepHandler: Send + Sync + 'static {
    /// Run the step and return the partial update to merge.
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>>;
}

/// External capability (tool) execution.
pub trait CapabilityInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        capability: String,
        params: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Durable key-value medium for checkpoints.
///
/// Calls are synchronous: a step is not complete until its checkpoint is
/// recorded.
pub trait CheckpointBackend: Send + Sync + 'static {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, in ascending order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Backend name for logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Invoker that refuses everything. Used when a run has no capabilities.
pub struct NoCapabilities;

impl CapabilityInvoker for NoCapabilities {
    fn invoke(
        &self,
        capability: String,
        _params: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Err(crate::error::SwarmError::CapabilityNotFound(capability)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwarmError;

    struct Echo;

    impl StepHandler for Echo {
        fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
            Box::pin(async move {
                Ok(StatePatch::new()
                    .with_output(ctx.step_id.clone(), serde_json::json!(ctx.attempt))
                    .with_progress(ctx.task, 100.0))
            })
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            run_id: RunId::from_string("r"),
            step_id: "a".into(),
            participant: "a".into(),
            role: "worker".into(),
            task: "t".into(),
            attempt: 0,
            view: Arc::new(ExecutionState::new()),
            capabilities: Arc::new(NoCapabilities),
        }
    }

    #[tokio::test]
    async fn handler_returns_patch() {
        let patch = Echo.execute(ctx()).await.unwrap();
        assert_eq!(patch.task_progress["t"], 100.0);
    }

    #[tokio::test]
    async fn no_capabilities_refuses() {
        let err = ctx()
            .capabilities
            .invoke("search".into(), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::CapabilityNotFound(c) if c == "search"));
    }
}
