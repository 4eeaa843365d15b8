//! Relayflow: a flow execution engine.
//!
//! A flow is a trigger followed by an ordered list of actions, each backed
//! by a connector. Trigger events (webhook deliveries or poll results)
//! become flow-run jobs; the runner executes the steps one by one through
//! the action queue and records every outcome as an auditable
//! `ExecutionStep`.
//!
//! The engine is designed to be embedded: stores, queue and notifier are
//! traits with file-backed and in-memory defaults, and the only inbound
//! surface is [`Engine::receive_webhook`].
#[cfg(feature = "schemars")]
pub mod schema;

pub mod apps;
pub mod config;
pub mod connector;
pub mod defaults;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod queue;
pub mod request;
pub mod traits;
pub mod triggers;
pub mod types;
pub mod validate;
pub mod variables;

#[cfg(test)]
mod test_support;

// Re-export public types at the crate level.

// config
pub use config::{ConfigError, EngineConfig, QueueConfig, RetryPolicy};

// connector
pub use connector::{
    ActionHandler, App, AppMeta, ArgumentDef, ConnectorCtx, ConnectorCtxBuilder,
    ConnectorRegistry, DynamicDataHandler, OperationMeta, PollResult, PollingTrigger, TriggerDef,
    TriggerItem, WebhookRequest, WebhookTrigger,
};

// defaults
pub use defaults::{FileQueue, FileStore, InMemoryQueue, InMemoryStore, LogNotifier};

// engine
pub use engine::{Engine, EngineBuilder, EngineError};

// errors
pub use errors::{FlowValidationError, NotifyError, QueueError, RegistrationError, StoreError};

// executor
pub use executor::{RunOutcome, RunnerError, TestRunReport};

// queue
pub use queue::{JobFailure, JobHandler};

// request
pub use request::{AuthContext, BeforeRequest, HttpClient, HttpResponse, RequestConfig};

// traits
pub use traits::{
    CreateOutcome, EnqueueOutcome, ExecutionFilter, ExecutionPage, ExecutionStore, FailureNotice,
    FlowFilter, FlowPage, FlowStore, Job, JobCounts, JobQueue, JobRecord, JobState, NewJob,
    Notifier,
};

// triggers
pub use triggers::{WebhookError, WebhookReceipt, payload_dedupe_key};

// types
pub use types::{
    ActionJob, Connection, ConnectorError, EmailJob, Execution, ExecutionStatus, ExecutionStep,
    FLOW_BUNDLE_SCHEMA_VERSION, Flow, FlowBundle, FlowRunJob, QueueJob, QueueName, Step,
    StepErrorKind, StepErrorPayload, StepKind, StepStatus, TriggerData, TriggerPollJob,
    TriggerState,
};

// validate
pub use validate::{validate_flow, validate_steps};

// variables
pub use variables::{ResolutionError, resolve_parameters};
