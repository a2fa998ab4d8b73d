use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::state::{
    CapabilityCall, CapabilityCompletion, ControlFlag, HelpRequest, Lww, Message,
};
use crate::types::StepOutcome;

/// Partial update returned by a step handler.
///
/// Each section is merged into the live state by its own rule; see
/// [`crate::reducers`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_progress: BTreeMap<String, f64>,
    /// participant → capabilities still granted. Intersected with the live
    /// matrix; an empty set revokes everything.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub permissions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quotas: BTreeMap<String, BTreeMap<String, u32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_requests: Vec<CapabilityCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_results: Vec<CapabilityCompletion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub help_requests: Vec<HelpRequest>,
    #[serde(default, skip_serializing_if = "ControlPatch::is_empty")]
    pub control: ControlPatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_continue: Option<Lww<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<Lww<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Lww<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<StepOutcome>,
}

impl ControlPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn with_message(mut self, sender: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(sender, content));
        self
    }

    pub fn with_output(mut self, step: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(step.into(), value);
        self
    }

    pub fn with_progress(mut self, task: impl Into<String>, progress: f64) -> Self {
        self.task_progress.insert(task.into(), progress);
        self
    }

    pub fn with_grants<I, S>(mut self, participant: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.insert(
            participant.into(),
            capabilities.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_help_request(mut self, request: HelpRequest) -> Self {
        self.help_requests.push(request);
        self
    }

    pub fn with_capability_result(
        mut self,
        call_id: Option<String>,
        capability: impl Into<String>,
        result: Value,
    ) -> Self {
        self.capability_results.push(CapabilityCompletion {
            call_id,
            capability: capability.into(),
            result,
        });
        self
    }

    /// Set a control flag, stamped now.
    pub fn with_flag(mut self, flag: ControlFlag, value: bool) -> Self {
        let entry = Some(Lww::now(value));
        match flag {
            ControlFlag::Continue => self.control.should_continue = entry,
            ControlFlag::Approval => self.control.requires_approval = entry,
            ControlFlag::Interrupt => self.control.interrupt = entry,
        }
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Reject values no merge rule can accept. Runs before anything merges.
    pub fn validate(&self) -> Result<()> {
        for (task, progress) in &self.task_progress {
            if progress.is_nan() || !(0.0..=100.0).contains(progress) {
                return Err(SwarmError::InvalidPatch(format!(
                    "progress for task '{}' must be within 0..=100, got {}",
                    task, progress
                )));
            }
        }
        for request in &self.help_requests {
            if request.topic.trim().is_empty() {
                return Err(SwarmError::InvalidPatch(format!(
                    "help request from '{}' has no topic",
                    request.sender
                )));
            }
        }
        for call in &self.capability_requests {
            if call.id.is_empty() {
                return Err(SwarmError::InvalidPatch(format!(
                    "capability request for '{}' has no id",
                    call.capability
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_patch_serializes_to_empty_object() {
        let json = serde_json::to_value(StatePatch::new()).unwrap();
        assert_eq!(json, json!({}));
        assert!(StatePatch::new().is_empty());
    }

    #[test]
    fn builder_fills_sections() {
        let patch = StatePatch::new()
            .with_output("writer", json!("draft"))
            .with_progress("writing", 50.0)
            .with_grants("writer", ["read", "search"])
            .with_flag(ControlFlag::Interrupt, true);
        assert_eq!(patch.outputs["writer"], json!("draft"));
        assert_eq!(patch.permissions["writer"].len(), 2);
        assert_eq!(patch.control.interrupt.as_ref().map(|l| l.value), Some(true));
        assert!(!patch.is_empty());
    }

    #[test]
    fn validate_rejects_out_of_range_progress() {
        assert!(StatePatch::new().with_progress("a", 100.0).validate().is_ok());
        assert!(StatePatch::new().with_progress("a", 0.0).validate().is_ok());
        assert!(StatePatch::new().with_progress("a", 100.5).validate().is_err());
        assert!(StatePatch::new().with_progress("a", -1.0).validate().is_err());
        assert!(StatePatch::new().with_progress("a", f64::NAN).validate().is_err());
    }

    #[test]
    fn validate_rejects_topicless_help() {
        let patch = StatePatch::new().with_help_request(HelpRequest::open("qa", " ", ""));
        assert!(matches!(patch.validate(), Err(SwarmError::InvalidPatch(_))));
    }

    #[test]
    fn deserializes_from_handler_json() {
        let patch: StatePatch = serde_json::from_value(json!({
            "outputs": { "qa": { "ok": true } },
            "task_progress": { "qa": 100.0 }
        }))
        .unwrap();
        assert_eq!(patch.task_progress["qa"], 100.0);
        assert!(patch.messages.is_empty());
    }
}
