//! In-memory flow and execution store.
//!
//! Used by tests and as the scratch store of authoring test runs. All state
//! sits behind one lock, so dedupe, cursor and immutability checks are
//! atomic with their writes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::errors::StoreError;
use crate::traits::{
    CreateOutcome, ExecutionFilter, ExecutionPage, ExecutionStore, FlowFilter, FlowPage, FlowStore,
};
use crate::types::{
    Connection, Execution, ExecutionStatus, ExecutionStep, Flow, TriggerData, TriggerState,
};

#[derive(Default)]
struct Inner {
    flows: HashMap<String, Flow>,
    trigger_data: HashMap<String, TriggerData>,
    connections: HashMap<String, Connection>,
    executions: HashMap<String, Execution>,
    /// `(flow_id, internal_id)` of non-test executions.
    internal_ids: HashMap<(String, String), String>,
    steps: HashMap<String, Vec<ExecutionStep>>,
}

/// Implements both [`FlowStore`] and [`ExecutionStore`].
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryStore {
    async fn put_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        self.inner.write().flows.insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self.inner.read().flows.get(flow_id).cloned())
    }

    async fn list_flows(&self, filter: &FlowFilter) -> Result<FlowPage, StoreError> {
        let inner = self.inner.read();
        let mut flows: Vec<&Flow> = inner.flows.values().filter(|f| filter.matches(f)).collect();
        flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        let total = flows.len();
        let flows = flows
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit())
            .cloned()
            .collect();
        Ok(FlowPage { flows, total })
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        inner.trigger_data.remove(flow_id);
        Ok(inner.flows.remove(flow_id).is_some())
    }

    async fn set_active(
        &self,
        flow_id: &str,
        active: bool,
        state: TriggerState,
    ) -> Result<Flow, StoreError> {
        let mut inner = self.inner.write();
        let flow = inner
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| StoreError::flow_not_found(flow_id))?;
        flow.active = active;
        flow.trigger_state = state;
        flow.updated_at = Utc::now();
        Ok(flow.clone())
    }

    async fn get_trigger_data(&self, flow_id: &str) -> Result<TriggerData, StoreError> {
        Ok(self
            .inner
            .read()
            .trigger_data
            .get(flow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_trigger_data(&self, flow_id: &str, data: &TriggerData) -> Result<(), StoreError> {
        self.inner
            .write()
            .trigger_data
            .insert(flow_id.to_string(), data.clone());
        Ok(())
    }

    async fn advance_cursor(
        &self,
        flow_id: &str,
        owner: Option<&str>,
        cursor: Option<String>,
        scheduled_job_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let active = inner
            .flows
            .get(flow_id)
            .is_some_and(|f| f.active && f.trigger_state == TriggerState::Active);
        if !active {
            return Ok(false);
        }
        let data = inner.trigger_data.entry(flow_id.to_string()).or_default();
        if data.scheduled_job_id.as_deref() != owner {
            return Ok(false);
        }
        if cursor.is_some() {
            data.cursor = cursor;
        }
        data.scheduled_job_id = scheduled_job_id;
        Ok(true)
    }

    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        self.inner
            .write()
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.inner.read().connections.get(connection_id).cloned())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.inner.write();
        if inner.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict {
                message: format!("execution {} already exists", execution.id),
            });
        }
        if !execution.test_run {
            let key = (execution.flow_id.clone(), execution.internal_id.clone());
            if let Some(existing) = inner.internal_ids.get(&key) {
                return Ok(CreateOutcome::Duplicate(existing.clone()));
            }
            inner.internal_ids.insert(key, execution.id.clone());
        }
        inner
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(CreateOutcome::Created)
    }

    async fn append_step(&self, step: &ExecutionStep) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.executions.contains_key(&step.execution_id) {
            return Err(StoreError::execution_not_found(&step.execution_id));
        }
        let steps = inner.steps.entry(step.execution_id.clone()).or_default();
        if steps.iter().any(|s| s.position == step.position) {
            return Err(StoreError::Conflict {
                message: format!(
                    "execution {} already has a step at position {}",
                    step.execution_id, step.position
                ),
            });
        }
        steps.push(step.clone());
        steps.sort_by_key(|s| s.position);
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<Execution, StoreError> {
        let mut inner = self.inner.write();
        let execution = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::execution_not_found(execution_id))?;
        if execution.is_terminal() {
            return Err(StoreError::Conflict {
                message: format!("execution {execution_id} already {}", execution.status),
            });
        }
        execution.status = status;
        execution.completed_at = Some(Utc::now());
        Ok(execution.clone())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.inner.read().executions.get(execution_id).cloned())
    }

    async fn get_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<ExecutionPage, StoreError> {
        let inner = self.inner.read();
        let mut executions: Vec<&Execution> = inner
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = executions.len();
        let executions = executions
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(ExecutionPage { executions, total })
    }

    async fn delete_for_flow(&self, flow_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        let ids: Vec<String> = inner
            .executions
            .values()
            .filter(|e| e.flow_id == flow_id)
            .map(|e| e.id.clone())
            .collect();
        for id in &ids {
            inner.executions.remove(id);
            inner.steps.remove(id);
        }
        inner.internal_ids.retain(|(f, _), _| f != flow_id);
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, Step, StepErrorKind, StepErrorPayload};
    use serde_json::json;

    fn flow(name: &str) -> Flow {
        Flow::new(
            name,
            vec![
                Step::trigger("webhook", "catch_raw_webhook"),
                Step::action("http", "make_request"),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_internal_id_is_not_created() {
        let store = InMemoryStore::new();
        let first = Execution::new("f1", "evt-1", false);
        let second = Execution::new("f1", "evt-1", false);
        assert_eq!(
            store.create_execution(&first).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.create_execution(&second).await.unwrap(),
            CreateOutcome::Duplicate(first.id.clone())
        );
        // Other flows and test runs are independent.
        let other = Execution::new("f2", "evt-1", false);
        assert_eq!(
            store.create_execution(&other).await.unwrap(),
            CreateOutcome::Created
        );
        let test = Execution::new("f1", "evt-1", true);
        assert_eq!(
            store.create_execution(&test).await.unwrap(),
            CreateOutcome::Created
        );
    }

    #[tokio::test]
    async fn steps_are_append_only() {
        let store = InMemoryStore::new();
        let flow = flow("f");
        let exec = Execution::new(&flow.id, "k", false);
        store.create_execution(&exec).await.unwrap();

        let action = &flow.steps[1];
        let trigger = &flow.steps[0];
        store
            .append_step(&ExecutionStep::success(&exec.id, action, json!({}), json!(2), 1))
            .await
            .unwrap();
        store
            .append_step(&ExecutionStep::success(&exec.id, trigger, json!({}), json!(1), 0))
            .await
            .unwrap();

        let err = store
            .append_step(&ExecutionStep::failure(
                &exec.id,
                action,
                json!({}),
                StepErrorPayload {
                    kind: StepErrorKind::Semantic,
                    message: "x".into(),
                    details: None,
                },
                1,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let positions: Vec<u32> = store
            .get_steps(&exec.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.position)
            .collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn complete_only_once() {
        let store = InMemoryStore::new();
        let exec = Execution::new("f", "k", false);
        store.create_execution(&exec).await.unwrap();
        let done = store
            .complete_execution(&exec.id, ExecutionStatus::Success)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert!(done.completed_at.is_some());
        assert!(
            store
                .complete_execution(&exec.id, ExecutionStatus::Failure)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cursor_only_advances_while_active() {
        let store = InMemoryStore::new();
        let flow = flow("poller");
        store.put_flow(&flow).await.unwrap();

        assert!(
            !store
                .advance_cursor(&flow.id, None, Some("c1".into()), None)
                .await
                .unwrap()
        );
        assert_eq!(store.get_trigger_data(&flow.id).await.unwrap().cursor, None);

        store
            .set_active(&flow.id, true, TriggerState::Active)
            .await
            .unwrap();
        assert!(
            store
                .advance_cursor(&flow.id, None, Some("c1".into()), Some("poll:1".into()))
                .await
                .unwrap()
        );
        // `None` keeps the stored cursor.
        assert!(
            store
                .advance_cursor(&flow.id, Some("poll:1"), None, None)
                .await
                .unwrap()
        );
        let data = store.get_trigger_data(&flow.id).await.unwrap();
        assert_eq!(data.cursor.as_deref(), Some("c1"));
        assert_eq!(data.scheduled_job_id, None);
    }

    #[tokio::test]
    async fn cursor_only_advances_for_the_scheduled_poll() {
        let store = InMemoryStore::new();
        let flow = flow("poller");
        store.put_flow(&flow).await.unwrap();
        store
            .set_active(&flow.id, true, TriggerState::Active)
            .await
            .unwrap();
        store
            .set_trigger_data(
                &flow.id,
                &TriggerData {
                    cursor: Some("3".into()),
                    scheduled_job_id: Some("poll:new".into()),
                    hook: None,
                },
            )
            .await
            .unwrap();

        assert!(
            !store
                .advance_cursor(&flow.id, Some("poll:old"), Some("9".into()), Some("poll:x".into()))
                .await
                .unwrap()
        );
        let data = store.get_trigger_data(&flow.id).await.unwrap();
        assert_eq!(data.cursor.as_deref(), Some("3"));
        assert_eq!(data.scheduled_job_id.as_deref(), Some("poll:new"));
    }

    #[tokio::test]
    async fn list_flows_paginates_and_searches() {
        let store = InMemoryStore::new();
        for i in 0..12 {
            store.put_flow(&flow(&format!("flow {i}"))).await.unwrap();
        }
        store.put_flow(&flow("GitLab issues")).await.unwrap();

        let page = store.list_flows(&FlowFilter::default()).await.unwrap();
        assert_eq!(page.total, 13);
        assert_eq!(page.flows.len(), 10);

        let page = store
            .list_flows(&FlowFilter {
                offset: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.flows.len(), 3);

        let page = store
            .list_flows(&FlowFilter {
                name: Some("gitlab".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn delete_for_flow_cascades() {
        let store = InMemoryStore::new();
        let flow = flow("f");
        let exec = Execution::new(&flow.id, "k", false);
        store.create_execution(&exec).await.unwrap();
        store
            .append_step(&ExecutionStep::success(
                &exec.id,
                &flow.steps[0],
                json!({}),
                json!({}),
                0,
            ))
            .await
            .unwrap();
        store
            .create_execution(&Execution::new("other", "k", false))
            .await
            .unwrap();

        assert_eq!(store.delete_for_flow(&flow.id).await.unwrap(), 1);
        assert!(store.get_execution(&exec.id).await.unwrap().is_none());
        assert!(store.get_steps(&exec.id).await.unwrap().is_empty());
        // The dedupe key is free again.
        assert_eq!(
            store
                .create_execution(&Execution::new(&flow.id, "k", false))
                .await
                .unwrap(),
            CreateOutcome::Created
        );
        let all = store
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(all.total, 2);
    }
}
