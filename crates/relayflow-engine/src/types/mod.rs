//! Data model of the flow engine.
//!
//! Every type here is `Serialize + Deserialize + Debug + Clone`. Map fields
//! use `BTreeMap` so stored documents and dedupe hashes are deterministic.

pub mod execution;
pub mod flow;
pub mod jobs;

pub use execution::*;
pub use flow::*;
pub use jobs::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Connector errors
// ---------------------------------------------------------------------------

/// Error raised by a connector call.
///
/// `Transient` and `Timeout` are retried by the action queue with bounded
/// backoff. `Semantic` (bad credentials, a 4xx, a validation rejection) is
/// recorded as a failure on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum ConnectorError {
    Transient {
        message: String,
    },
    Semantic {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Timeout {
        elapsed_ms: u64,
    },
    Unsupported {
        message: String,
    },
}

impl ConnectorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::Semantic {
            message: message.into(),
            details: None,
        }
    }

    pub fn semantic_with(message: impl Into<String>, details: Value) -> Self {
        Self::Semantic {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Whether the queue layer should try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient: {message}"),
            Self::Semantic { message, .. } => write!(f, "semantic: {message}"),
            Self::Timeout { elapsed_ms } => write!(f, "timeout after {elapsed_ms}ms"),
            Self::Unsupported { message } => write!(f, "unsupported: {message}"),
        }
    }
}

impl std::error::Error for ConnectorError {}
