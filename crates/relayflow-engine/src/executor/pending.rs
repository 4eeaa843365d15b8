//! Hand-off between a flow run waiting on an action and the worker that
//! runs it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::types::{ExecutionStep, StepErrorKind, StepErrorPayload};

/// Final, persisted outcome of one action step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActionOutcome {
    Success(Value),
    Failure(StepErrorPayload),
}

impl ActionOutcome {
    pub(crate) fn from_step(step: &ExecutionStep) -> Self {
        if step.is_success() {
            Self::Success(step.data_out.clone().unwrap_or(Value::Null))
        } else {
            Self::Failure(step.error.clone().unwrap_or_else(|| StepErrorPayload {
                kind: StepErrorKind::Transient,
                message: "step failed without an error payload".into(),
                details: None,
            }))
        }
    }
}

/// Waiters keyed by action job id.
///
/// The runner registers before enqueueing; the action worker completes the
/// waiter only after the step is persisted.
#[derive(Clone, Default)]
pub(crate) struct PendingActions {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<ActionOutcome>>>>,
}

impl PendingActions {
    pub(crate) fn register(&self, job_id: &str) -> oneshot::Receiver<ActionOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(job_id.to_string(), tx);
        rx
    }

    /// Deliver `outcome`. Returns `false` when nobody in this process waits.
    pub(crate) fn complete(&self, job_id: &str, outcome: ActionOutcome) -> bool {
        match self.waiters.lock().remove(job_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, job_id: &str) {
        self.waiters.lock().remove(job_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_wakes_waiter_once() {
        let pending = PendingActions::default();
        let rx = pending.register("action:e:2");
        assert_eq!(pending.len(), 1);

        assert!(pending.complete("action:e:2", ActionOutcome::Success(json!(1))));
        assert_eq!(rx.await.unwrap(), ActionOutcome::Success(json!(1)));
        assert!(!pending.complete("action:e:2", ActionOutcome::Success(json!(2))));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn cancel_drops_sender() {
        let pending = PendingActions::default();
        let mut rx = pending.register("j");
        pending.cancel("j");
        assert!(rx.try_recv().is_err());
    }
}
