//! File-system backed flow and execution store.
//!
//! Layout:
//! ```text
//! {base_dir}/flows/{flow_id}.json
//! {base_dir}/trigger_data/{flow_id}.json
//! {base_dir}/connections/{connection_id}.json
//! {base_dir}/executions/{execution_id}.json
//! {base_dir}/steps/{execution_id}.jsonl     one ExecutionStep per line
//! {base_dir}/dedupe/{sha256(flow_id, internal_id)}   holds the execution id
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::errors::StoreError;
use crate::traits::{
    CreateOutcome, ExecutionFilter, ExecutionPage, ExecutionStore, FlowFilter, FlowPage, FlowStore,
};
use crate::types::{
    Connection, Execution, ExecutionStatus, ExecutionStep, Flow, TriggerData, TriggerState,
};

/// File-system store implementing [`FlowStore`] and [`ExecutionStore`].
///
/// Whole-file writes go through a temp file and a rename so a crash never
/// leaves a half-written record. Read-modify-write sequences (dedupe,
/// cursor advance, step append) hold one process-wide lock.
pub struct FileStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

const DIRS: [&str; 6] = [
    "flows",
    "trigger_data",
    "connections",
    "executions",
    "steps",
    "dedupe",
];

impl FileStore {
    /// Create a store rooted at `base_dir`, creating its directories.
    pub fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        for dir in DIRS {
            std::fs::create_dir_all(base_dir.join(dir))
                .map_err(|e| StoreError::store(format!("failed to create {dir} directory: {e}")))?;
        }
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, dir: &str, id: &str, ext: &str) -> PathBuf {
        self.base_dir.join(dir).join(format!("{id}.{ext}"))
    }

    fn dedupe_path(&self, flow_id: &str, internal_id: &str) -> PathBuf {
        let hash = Sha256::digest(format!("{flow_id}\n{internal_id}").as_bytes());
        self.base_dir.join("dedupe").join(format!("{hash:x}"))
    }

    fn read_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError> {
        let path = self.path("steps", execution_id, "jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| StoreError::store(format!("failed to read steps: {e}")))?;
        let mut steps = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ExecutionStep>(line) {
                Ok(step) => steps.push(step),
                Err(e) => {
                    tracing::warn!(execution_id, error = %e, "skipping corrupt step record");
                }
            }
        }
        Ok(steps)
    }

    fn list_dir<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, StoreError> {
        let entries = std::fs::read_dir(self.base_dir.join(dir))
            .map_err(|e| StoreError::store(format!("failed to read {dir} directory: {e}")))?;
        let mut items = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<T>(&path)? {
                Some(item) => items.push(item),
                None => continue,
            }
        }
        Ok(items)
    }
}

/// Write `data` to a temp file next to `path`, then rename over it.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    std::fs::write(&temp, data)
        .map_err(|e| StoreError::store(format!("failed to write temp file: {e}")))?;
    std::fs::rename(&temp, path)
        .map_err(|e| StoreError::store(format!("failed to rename temp file: {e}")))?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::store(format!("failed to serialize: {e}")))?;
    atomic_write(path, &data)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)
        .map_err(|e| StoreError::store(format!("failed to read {}: {e}", path.display())))?;
    let value = serde_json::from_slice(&data).map_err(|e| {
        StoreError::store(format!("failed to deserialize {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::store(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}

#[async_trait]
impl FlowStore for FileStore {
    async fn put_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        write_json(&self.path("flows", &flow.id, "json"), flow)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        read_json(&self.path("flows", flow_id, "json"))
    }

    async fn list_flows(&self, filter: &FlowFilter) -> Result<FlowPage, StoreError> {
        let mut flows: Vec<Flow> = self
            .list_dir::<Flow>("flows")?
            .into_iter()
            .filter(|f| filter.matches(f))
            .collect();
        flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        let total = flows.len();
        let flows = flows
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit())
            .collect();
        Ok(FlowPage { flows, total })
    }

    async fn delete_flow(&self, flow_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        remove_if_exists(&self.path("trigger_data", flow_id, "json"))?;
        remove_if_exists(&self.path("flows", flow_id, "json"))
    }

    async fn set_active(
        &self,
        flow_id: &str,
        active: bool,
        state: TriggerState,
    ) -> Result<Flow, StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.path("flows", flow_id, "json");
        let mut flow: Flow = read_json(&path)?.ok_or_else(|| StoreError::flow_not_found(flow_id))?;
        flow.active = active;
        flow.trigger_state = state;
        flow.updated_at = Utc::now();
        write_json(&path, &flow)?;
        Ok(flow)
    }

    async fn get_trigger_data(&self, flow_id: &str) -> Result<TriggerData, StoreError> {
        Ok(read_json(&self.path("trigger_data", flow_id, "json"))?.unwrap_or_default())
    }

    async fn set_trigger_data(&self, flow_id: &str, data: &TriggerData) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        write_json(&self.path("trigger_data", flow_id, "json"), data)
    }

    async fn advance_cursor(
        &self,
        flow_id: &str,
        owner: Option<&str>,
        cursor: Option<String>,
        scheduled_job_id: Option<String>,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let flow: Option<Flow> = read_json(&self.path("flows", flow_id, "json"))?;
        if !flow.is_some_and(|f| f.active && f.trigger_state == TriggerState::Active) {
            return Ok(false);
        }
        let path = self.path("trigger_data", flow_id, "json");
        let mut data: TriggerData = read_json(&path)?.unwrap_or_default();
        if data.scheduled_job_id.as_deref() != owner {
            return Ok(false);
        }
        if cursor.is_some() {
            data.cursor = cursor;
        }
        data.scheduled_job_id = scheduled_job_id;
        write_json(&path, &data)?;
        Ok(true)
    }

    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        write_json(&self.path("connections", &connection.id, "json"), connection)
    }

    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        read_json(&self.path("connections", connection_id, "json"))
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn create_execution(&self, execution: &Execution) -> Result<CreateOutcome, StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.path("executions", &execution.id, "json");
        if path.exists() {
            return Err(StoreError::Conflict {
                message: format!("execution {} already exists", execution.id),
            });
        }
        if !execution.test_run {
            let marker = self.dedupe_path(&execution.flow_id, &execution.internal_id);
            if marker.exists() {
                let existing = std::fs::read_to_string(&marker)
                    .map_err(|e| StoreError::store(format!("failed to read dedupe marker: {e}")))?;
                return Ok(CreateOutcome::Duplicate(existing.trim().to_string()));
            }
            atomic_write(&marker, execution.id.as_bytes())?;
        }
        write_json(&path, execution)?;
        Ok(CreateOutcome::Created)
    }

    async fn append_step(&self, step: &ExecutionStep) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if !self.path("executions", &step.execution_id, "json").exists() {
            return Err(StoreError::execution_not_found(&step.execution_id));
        }
        let mut steps = self.read_steps(&step.execution_id)?;
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

        let mut buf = Vec::new();
        for s in &steps {
            let line = serde_json::to_vec(s)
                .map_err(|e| StoreError::store(format!("failed to serialize step: {e}")))?;
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }
        atomic_write(&self.path("steps", &step.execution_id, "jsonl"), &buf)
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<Execution, StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.path("executions", execution_id, "json");
        let mut execution: Execution =
            read_json(&path)?.ok_or_else(|| StoreError::execution_not_found(execution_id))?;
        if execution.is_terminal() {
            return Err(StoreError::Conflict {
                message: format!("execution {execution_id} already {}", execution.status),
            });
        }
        execution.status = status;
        execution.completed_at = Some(Utc::now());
        write_json(&path, &execution)?;
        Ok(execution)
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError> {
        read_json(&self.path("executions", execution_id, "json"))
    }

    async fn get_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError> {
        self.read_steps(execution_id)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<ExecutionPage, StoreError> {
        let mut executions: Vec<Execution> = self
            .list_dir::<Execution>("executions")?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = executions.len();
        let executions = executions
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ExecutionPage { executions, total })
    }

    async fn delete_for_flow(&self, flow_id: &str) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let executions: Vec<Execution> = self
            .list_dir::<Execution>("executions")?
            .into_iter()
            .filter(|e| e.flow_id == flow_id)
            .collect();
        for execution in &executions {
            remove_if_exists(&self.path("steps", &execution.id, "jsonl"))?;
            remove_if_exists(&self.path("executions", &execution.id, "json"))?;
            if !execution.test_run {
                remove_if_exists(&self.dedupe_path(flow_id, &execution.internal_id))?;
            }
        }
        Ok(executions.len())
    }
}
