//! Engine configuration: worker concurrency per queue, intervals, timeouts
//! and the retry policy for action jobs.
//!
//! An [`EngineConfig`] is handed to [`EngineBuilder::config`](crate::EngineBuilder::config)
//! and owned by the engine. Nothing here is process-global.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::QueueName;

/// Errors from [`EngineConfig::from_env`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: String, message: String },
}

/// Worker settings for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Jobs processed in parallel by this queue's workers.
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency }
    }
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct RetryPolicy {
    /// Total attempts (1 = no retry). Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds. Default: 1 000.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Backoff multiplier per attempt. Default: 2.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after the `attempt`-th failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Process-wide engine settings, passed explicitly at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    #[serde(default = "default_flow_queue")]
    pub flow_queue: QueueConfig,
    #[serde(default = "default_trigger_queue")]
    pub trigger_queue: QueueConfig,
    #[serde(default = "default_action_queue")]
    pub action_queue: QueueConfig,
    #[serde(default = "default_email_queue")]
    pub email_queue: QueueConfig,
    /// Interval between polls of a polling trigger.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout around each connector call.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default)]
    pub action_retry: RetryPolicy,
    /// Base of the URL handed to `register_hook`.
    #[serde(default = "default_webhook_base_url")]
    pub webhook_base_url: String,
    /// Substituted for `{DOCS_URL}` in app metadata.
    #[serde(default = "default_docs_url")]
    pub docs_url: String,
    /// Root directory of the file-backed store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_flow_queue() -> QueueConfig {
    QueueConfig::new(10)
}
fn default_trigger_queue() -> QueueConfig {
    QueueConfig::new(10)
}
fn default_action_queue() -> QueueConfig {
    QueueConfig::new(10)
}
fn default_email_queue() -> QueueConfig {
    QueueConfig::new(2)
}
fn default_poll_interval_ms() -> u64 {
    15 * 60 * 1_000
}
fn default_action_timeout_ms() -> u64 {
    30_000
}
fn default_webhook_base_url() -> String {
    "http://localhost:3000".into()
}
fn default_docs_url() -> String {
    "http://localhost:3000/docs".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_queue: default_flow_queue(),
            trigger_queue: default_trigger_queue(),
            action_queue: default_action_queue(),
            email_queue: default_email_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            action_retry: RetryPolicy::default(),
            webhook_base_url: default_webhook_base_url(),
            docs_url: default_docs_url(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `RELAYFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("RELAYFLOW_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("RELAYFLOW_ACTION_TIMEOUT_MS")? {
            config.action_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("RELAYFLOW_ACTION_MAX_ATTEMPTS")? {
            config.action_retry.max_attempts = v;
        }
        if let Some(v) = env_string("RELAYFLOW_WEBHOOK_BASE_URL")? {
            config.webhook_base_url = v;
        }
        if let Some(v) = env_string("RELAYFLOW_DOCS_URL")? {
            config.docs_url = v;
        }
        if let Some(v) = env_string("RELAYFLOW_DATA_DIR")? {
            config.data_dir = PathBuf::from(v);
        }
        for queue in QueueName::ALL {
            let var = format!("RELAYFLOW_{}_CONCURRENCY", queue.as_str().to_uppercase());
            if let Some(v) = env_parse::<usize>(&var)? {
                config.queue_mut(queue).concurrency = v;
            }
        }

        Ok(config)
    }

    pub fn queue(&self, queue: QueueName) -> &QueueConfig {
        match queue {
            QueueName::Flow => &self.flow_queue,
            QueueName::Trigger => &self.trigger_queue,
            QueueName::Action => &self.action_queue,
            QueueName::Email => &self.email_queue,
        }
    }

    fn queue_mut(&mut self, queue: QueueName) -> &mut QueueConfig {
        match queue {
            QueueName::Flow => &mut self.flow_queue,
            QueueName::Trigger => &mut self.trigger_queue,
            QueueName::Action => &mut self.action_queue,
            QueueName::Email => &mut self.email_queue,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// The URL a webhook trigger registers with the remote service.
    pub fn webhook_url(&self, flow_id: &str) -> String {
        format!(
            "{}/webhooks/flows/{flow_id}",
            self.webhook_base_url.trim_end_matches('/')
        )
    }
}

fn env_string(var: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Invalid {
            var: var.to_string(),
            message: e.to_string(),
        }),
    }
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var: var.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}
