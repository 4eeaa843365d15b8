//! Trigger subsystem: registration lifecycle, webhook ingestion and the
//! poll job handler.
//!
//! Nothing here runs steps. Each accepted trigger event becomes one
//! flow-run job on the flow queue.

pub(crate) mod lifecycle;
pub(crate) mod poller;
pub mod webhook;

pub use webhook::{WebhookError, WebhookReceipt, payload_dedupe_key};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::connector::ConnectorCtx;
use crate::connector::ctx::ContextFactory;
use crate::types::{ConnectorError, Flow, Step, TriggerData};

/// Per-flow lock serializing activation, deactivation and the start of a
/// poll job.
#[derive(Clone, Default)]
pub(crate) struct FlowLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FlowLocks {
    pub(crate) async fn lock(&self, flow_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .entry(flow_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub(crate) fn forget(&self, flow_id: &str) {
        self.locks.lock().remove(flow_id);
    }
}

/// Context for a flow's trigger step, carrying its cursor and hook data.
pub(crate) async fn trigger_context(
    contexts: &ContextFactory,
    flow: &Flow,
    step: &Step,
    data: &TriggerData,
    test_run: bool,
) -> Result<ConnectorCtx, ConnectorError> {
    Ok(contexts
        .for_step(flow, step)
        .await?
        .test_run(test_run)
        .cursor(data.cursor.clone())
        .hook(data.hook.clone())
        .build())
}

/// Fresh id for the next poll job of a flow.
pub(crate) fn poll_job_id(flow_id: &str) -> String {
    format!("poll:{flow_id}:{}", uuid::Uuid::new_v4())
}
