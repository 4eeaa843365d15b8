//! Flow definitions: the long-lived aggregate root, its steps, and the
//! credentials steps run with.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::FlowValidationError;
use crate::validate::validate_steps;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Whether a step is the flow's event source or one of its actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trigger,
    Action,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trigger => f.write_str("trigger"),
            Self::Action => f.write_str("action"),
        }
    }
}

/// One position within a flow.
///
/// Position 1 is always the trigger; positions `2..=N` are actions, run in
/// order. `parameters` may reference earlier outputs with `{{stepN.path}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub flow_id: String,
    #[serde(default)]
    pub position: u32,
    pub kind: StepKind,
    pub app_key: String,
    pub operation_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl Step {
    fn new(kind: StepKind, app_key: &str, operation_key: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: String::new(),
            position: 0,
            kind,
            app_key: app_key.to_string(),
            operation_key: operation_key.to_string(),
            parameters: BTreeMap::new(),
            connection_id: None,
        }
    }

    /// A trigger step for `app_key` / `operation_key`.
    pub fn trigger(app_key: &str, operation_key: &str) -> Self {
        Self::new(StepKind::Trigger, app_key, operation_key)
    }

    /// An action step for `app_key` / `operation_key`.
    pub fn action(app_key: &str, operation_key: &str) -> Self {
        Self::new(StepKind::Action, app_key, operation_key)
    }

    /// Set a single parameter.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Attach the connection (credentials) the step runs with.
    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// The step parameters as a JSON object.
    pub fn parameters_value(&self) -> Value {
        Value::Object(
            self.parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Trigger registration lifecycle
// ---------------------------------------------------------------------------

/// Registration lifecycle of a flow's trigger.
///
/// `inactive → registering → active → unregistering → inactive`, plus
/// `registering → inactive` when registration fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    #[default]
    Inactive,
    Registering,
    Active,
    Unregistering,
}

impl TriggerState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TriggerState) -> bool {
        matches!(
            (self, next),
            (Self::Inactive, Self::Registering)
                | (Self::Registering, Self::Active)
                | (Self::Registering, Self::Inactive)
                | (Self::Active, Self::Unregistering)
                | (Self::Unregistering, Self::Inactive)
        )
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Unregistering => "unregistering",
        };
        f.write_str(s)
    }
}

/// Flow-scoped trigger state owned by the trigger subsystem.
///
/// Only the poll job of the owning flow advances `cursor`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct TriggerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_id: Option<String>,
    /// Whatever the connector returned from `register_hook`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<Value>,
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// A user-defined pipeline: one trigger followed by ordered actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub trigger_state: TriggerState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Build a new inactive flow. Steps are numbered in the given order
    /// (first = position 1) and the structure is validated.
    pub fn new(name: &str, steps: Vec<Step>) -> Result<Self, FlowValidationError> {
        let id = Uuid::new_v4().to_string();
        let steps: Vec<Step> = steps
            .into_iter()
            .enumerate()
            .map(|(i, mut step)| {
                step.flow_id = id.clone();
                step.position = i as u32 + 1;
                step
            })
            .collect();

        validate_steps(&steps).map_err(|errors| FlowValidationError { errors })?;

        let now = Utc::now();
        Ok(Self {
            id,
            name: name.to_string(),
            active: false,
            steps,
            trigger_state: TriggerState::Inactive,
            created_at: now,
            updated_at: now,
        })
    }

    /// The trigger step (position 1).
    pub fn trigger_step(&self) -> Option<&Step> {
        self.step_at(1)
    }

    /// Action steps in position order.
    pub fn action_steps(&self) -> impl Iterator<Item = &Step> {
        let mut actions: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::Action)
            .collect();
        actions.sort_by_key(|s| s.position);
        actions.into_iter()
    }

    pub fn step_at(&self, position: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.position == position)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Copy of this flow with fresh flow and step ids, inactive.
    pub(crate) fn duplicate(&self) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let steps = self
            .steps
            .iter()
            .map(|s| Step {
                id: Uuid::new_v4().to_string(),
                flow_id: id.clone(),
                ..s.clone()
            })
            .collect();
        Self {
            id,
            name: self.name.clone(),
            active: false,
            steps,
            trigger_state: TriggerState::Inactive,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Current schema version of [`FlowBundle`].
pub const FLOW_BUNDLE_SCHEMA_VERSION: u16 = 1;

/// Self-contained export of a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct FlowBundle {
    pub schema_version: u16,
    pub flow: Flow,
    pub exported_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Stored credentials for one app, referenced by steps via `connection_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Connection {
    pub id: String,
    pub app_key: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(app_key: &str, data: BTreeMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app_key: app_key.to_string(),
            data,
            verified: false,
            created_at: Utc::now(),
        }
    }
}
