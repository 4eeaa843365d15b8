//! Error types for the persistence, queue and trigger seams.

use thiserror::Error;

use crate::types::ConnectorError;

/// Errors from [`FlowStore`](super::traits::FlowStore) and
/// [`ExecutionStore`](super::traits::ExecutionStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("store error: {message}")]
    Store { message: String },
}

impl StoreError {
    pub(crate) fn flow_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "flow",
            id: id.to_string(),
        }
    }

    pub(crate) fn execution_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "execution",
            id: id.to_string(),
        }
    }

    pub(crate) fn store(message: impl std::fmt::Display) -> Self {
        Self::Store {
            message: message.to_string(),
        }
    }
}

/// Errors from [`JobQueue`](super::traits::JobQueue).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("queue error: {message}")]
    Queue { message: String },
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("job serialization error: {message}")]
    Serialization { message: String },
}

/// Errors from [`Notifier`](super::traits::Notifier).
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification failed: {message}")]
    Delivery { message: String },
}

/// Raised when activating a flow's trigger fails. The flow stays inactive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistrationError {
    #[error("flow {flow_id} has no trigger step")]
    MissingTrigger { flow_id: String },
    #[error("unknown trigger {app_key}.{operation_key}")]
    UnknownTrigger {
        app_key: String,
        operation_key: String,
    },
    #[error("trigger registration failed: {0}")]
    Connector(#[from] ConnectorError),
    #[error("cannot move trigger from {from} to {to}")]
    InvalidState { from: String, to: String },
    #[error("registration store error: {0}")]
    Store(#[from] StoreError),
    #[error("registration queue error: {0}")]
    Queue(#[from] QueueError),
}

/// A flow definition that failed validation.
#[derive(Debug, Error)]
#[error("invalid flow: {}", errors.join("; "))]
pub struct FlowValidationError {
    pub errors: Vec<String>,
}
