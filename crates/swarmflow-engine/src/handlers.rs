use std::collections::HashMap;
use std::sync::Arc;

use swarmflow_core::error::{Result, SwarmError};
use swarmflow_core::traits::StepHandler;

/// Caller-owned map from participants to the handlers that run them.
///
/// Lookup order: participant id, then role, then the default.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    by_participant: HashMap<String, Arc<dyn StepHandler>>,
    by_role: HashMap<String, Arc<dyn StepHandler>>,
    default: Option<Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.by_participant.insert(participant.into(), handler);
    }

    pub fn register_role(&mut self, role: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.by_role.insert(role.into(), handler);
    }

    pub fn with_handler(mut self, participant: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(participant, handler);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.register_role(role, handler);
        self
    }

    pub fn with_default(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.default = Some(handler);
        self
    }

    pub fn resolve(&self, participant: &str, role: &str) -> Result<Arc<dyn StepHandler>> {
        self.by_participant
            .get(participant)
            .or_else(|| self.by_role.get(role))
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| SwarmError::HandlerMissing(participant.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_participant.len() + self.by_role.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use swarmflow_core::patch::StatePatch;
    use swarmflow_core::traits::StepContext;

    struct Tag(&'static str);

    impl StepHandler for Tag {
        fn execute(&self, _ctx: StepContext) -> BoxFuture<'_, Result<StatePatch>> {
            let tag = self.0;
            Box::pin(async move { Ok(StatePatch::new().with_field("tag", serde_json::json!(tag))) })
        }
    }

    #[test]
    fn participant_beats_role_beats_default() {
        let registry = HandlerRegistry::new()
            .with_handler("writer", Arc::new(Tag("participant")))
            .with_role("editor", Arc::new(Tag("role")))
            .with_default(Arc::new(Tag("default")));
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("writer", "editor").is_ok());
        assert!(registry.resolve("someone", "editor").is_ok());
        assert!(registry.resolve("someone", "other").is_ok());

        let bare = HandlerRegistry::new();
        assert!(matches!(
            bare.resolve("x", "y"),
            Err(SwarmError::HandlerMissing(p)) if p == "x"
        ));
    }
}
