//! Queue job schemas: the wire contract between the trigger subsystem, the
//! flow runner, the action workers and the notifier.
//!
//! Payload fields are camelCase on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::QueueError;

/// The four logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Flow,
    Trigger,
    Action,
    Email,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [Self::Flow, Self::Trigger, Self::Action, Self::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Trigger => "trigger",
            Self::Action => "action",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed job bound to exactly one queue.
pub trait QueueJob: Serialize + DeserializeOwned {
    const QUEUE: QueueName;

    fn to_payload(&self) -> Result<Value, QueueError> {
        serde_json::to_value(self).map_err(|e| QueueError::Serialization {
            message: e.to_string(),
        })
    }

    fn from_payload(payload: &Value) -> Result<Self, QueueError> {
        serde_json::from_value(payload.clone()).map_err(|e| QueueError::Serialization {
            message: format!("{} job: {e}", Self::QUEUE),
        })
    }
}

/// Run one execution of a flow for one trigger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct FlowRunJob {
    pub flow_id: String,
    pub payload: Value,
    #[serde(default)]
    pub test_run: bool,
    pub dedupe_key: String,
}

impl FlowRunJob {
    /// Queue-level job id; redelivery of the same event collapses onto it
    /// while the job is still queued.
    pub fn job_id(&self) -> String {
        format!("flow-run:{}:{}", self.flow_id, self.dedupe_key)
    }
}

impl QueueJob for FlowRunJob {
    const QUEUE: QueueName = QueueName::Flow;
}

/// Poll a flow's polling trigger once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct TriggerPollJob {
    pub flow_id: String,
}

impl QueueJob for TriggerPollJob {
    const QUEUE: QueueName = QueueName::Trigger;
}

/// Run one action step of one execution.
///
/// `flow_id`, `position` and `test_run` travel alongside the five contract
/// fields so the worker can persist the step without re-reading the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ActionJob {
    pub execution_id: String,
    pub step_id: String,
    pub connector_key: String,
    pub operation_key: String,
    pub input: Value,
    #[serde(default)]
    pub flow_id: String,
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub test_run: bool,
}

impl ActionJob {
    /// One action job per execution position.
    pub fn job_id(&self) -> String {
        format!("action:{}:{}", self.execution_id, self.position)
    }
}

impl QueueJob for ActionJob {
    const QUEUE: QueueName = QueueName::Action;
}

/// Notify the flow owner that an execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    pub flow_id: String,
    pub execution_id: String,
}

impl EmailJob {
    /// At most one notification per execution.
    pub fn job_id(&self) -> String {
        format!("email:{}", self.execution_id)
    }
}

impl QueueJob for EmailJob {
    const QUEUE: QueueName = QueueName::Email;
}
