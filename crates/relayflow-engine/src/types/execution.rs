//! Execution history: one [`Execution`] per trigger event and one
//! [`ExecutionStep`] per step that ran.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ConnectorError;
use super::flow::Step;
use crate::variables::ResolutionError;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure,
    /// Was running when the engine stopped; found on restart.
    Interrupted,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// One run of a flow, created when its trigger fires.
///
/// `internal_id` is the dedupe key of the trigger event that created it; two
/// non-test executions of the same flow never share one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    #[serde(default)]
    pub test_run: bool,
    pub internal_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(flow_id: &str, internal_id: &str, test_run: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            test_run,
            internal_id: internal_id.to_string(),
            status: ExecutionStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Running
    }
}

// ---------------------------------------------------------------------------
// Execution steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
}

/// Classification carried on a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StepErrorKind {
    Transient,
    Semantic,
    Timeout,
    Resolution,
    Unsupported,
}

/// Error payload persisted on a `failure` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct StepErrorPayload {
    pub kind: StepErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&ConnectorError> for StepErrorPayload {
    fn from(err: &ConnectorError) -> Self {
        let (kind, details) = match err {
            ConnectorError::Transient { .. } => (StepErrorKind::Transient, None),
            ConnectorError::Semantic { details, .. } => (StepErrorKind::Semantic, details.clone()),
            ConnectorError::Timeout { .. } => (StepErrorKind::Timeout, None),
            ConnectorError::Unsupported { .. } => (StepErrorKind::Unsupported, None),
        };
        Self {
            kind,
            message: err.to_string(),
            details,
        }
    }
}

impl From<&ResolutionError> for StepErrorPayload {
    fn from(err: &ResolutionError) -> Self {
        Self {
            kind: StepErrorKind::Resolution,
            message: err.to_string(),
            details: None,
        }
    }
}

/// Persisted outcome of one step within one execution. Never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct ExecutionStep {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    pub position: u32,
    pub status: StepStatus,
    /// Parameters after variable substitution.
    #[serde(default)]
    pub data_in: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_out: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorPayload>,
    /// Connector invocations made for this step (0 for the trigger step and
    /// for resolution failures).
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn success(
        execution_id: &str,
        step: &Step,
        data_in: Value,
        data_out: Value,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            position: step.position,
            status: StepStatus::Success,
            data_in,
            data_out: Some(data_out),
            error: None,
            attempts,
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        execution_id: &str,
        step: &Step,
        data_in: Value,
        error: StepErrorPayload,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            position: step.position,
            status: StepStatus::Failure,
            data_in,
            data_out: None,
            error: Some(error),
            attempts,
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn semantic_error_keeps_details() {
        let err = ConnectorError::semantic_with("rejected", json!({"status": 422}));
        let payload = StepErrorPayload::from(&err);
        assert_eq!(payload.kind, StepErrorKind::Semantic);
        assert_eq!(payload.details, Some(json!({"status": 422})));
        assert_eq!(payload.message, "semantic: rejected");
    }

    #[test]
    fn resolution_error_payload() {
        let err = ResolutionError::StepNotExecuted {
            reference: "step3.a".into(),
            position: 3,
        };
        let payload = StepErrorPayload::from(&err);
        assert_eq!(payload.kind, StepErrorKind::Resolution);
        assert!(payload.message.contains("step3.a"));
    }

    #[test]
    fn execution_starts_running() {
        let exec = Execution::new("flow-1", "key-1", false);
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(!exec.is_terminal());
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn step_record_serializes_snake_case() {
        let step = Step::action("http", "make_request");
        let record = ExecutionStep::success("exec-1", &step, json!({}), json!({"ok": true}), 1);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data_out"]["ok"], true);
        assert!(value.get("error").is_none());
    }
}
