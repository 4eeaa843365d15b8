//! Engine error types.

use thiserror::Error;

use crate::errors::{FlowValidationError, QueueError, RegistrationError, StoreError};
use crate::executor::RunnerError;
use crate::triggers::WebhookError;
use crate::types::ConnectorError;

/// Errors from [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The requested flow was not found.
    #[error("flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },
    /// The requested execution was not found.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },
    #[error("connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },
    /// No app with this key is registered.
    #[error("unknown app: {app_key}")]
    UnknownApp { app_key: String },
    #[error("unknown dynamic data {app_key}.{key}")]
    UnknownDynamicData { app_key: String, key: String },
    /// The execution has no recorded trigger output to replay.
    #[error("execution {execution_id} has no trigger output")]
    NothingToRetry { execution_id: String },
    #[error("unsupported flow bundle schema version {version}")]
    BundleVersion { version: u16 },
    #[error(transparent)]
    Validation(#[from] FlowValidationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// An error during engine construction.
    #[error("build error: {message}")]
    Build { message: String },
}
