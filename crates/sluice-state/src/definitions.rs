use crate::StateError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::model::{ExecutionStatus, WorkflowDefinition};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tokio::task::spawn_blocking;
use uuid::Uuid;
use walkdir::WalkDir;

/// Terminal execution history: the record written exactly once when an
/// execution leaves the hot store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub execution_id: Uuid,
    pub final_status: ExecutionStatus,
    pub node_outputs: HashMap<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Immutable cold store for DAG definitions plus terminal execution
/// history. Definitions are written once at submission and never
/// mutated.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn save_dag(&self, definition: &WorkflowDefinition) -> Result<(), StateError>;

    async fn load_dag(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StateError>;

    async fn record_terminal(
        &self,
        execution_id: Uuid,
        final_status: ExecutionStatus,
        node_outputs: HashMap<String, Value>,
    ) -> Result<(), StateError>;

    async fn load_terminal(&self, execution_id: Uuid)
    -> Result<Option<TerminalRecord>, StateError>;

    async fn list_workflows(&self) -> Result<Vec<Uuid>, StateError>;
}

#[derive(Default)]
pub struct MemoryDefinitionStore {
    workflows: Mutex<HashMap<Uuid, WorkflowDefinition>>,
    terminals: Mutex<HashMap<Uuid, TerminalRecord>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn save_dag(&self, definition: &WorkflowDefinition) -> Result<(), StateError> {
        let mut workflows = self.workflows.lock().expect("definition mutex poisoned");
        if workflows.contains_key(&definition.workflow_id) {
            return Err(StateError::AlreadyExists(
                definition.workflow_id.to_string(),
            ));
        }
        workflows.insert(definition.workflow_id, definition.clone());
        Ok(())
    }

    async fn load_dag(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StateError> {
        self.workflows
            .lock()
            .expect("definition mutex poisoned")
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(workflow_id.to_string()))
    }

    async fn record_terminal(
        &self,
        execution_id: Uuid,
        final_status: ExecutionStatus,
        node_outputs: HashMap<String, Value>,
    ) -> Result<(), StateError> {
        self.terminals
            .lock()
            .expect("definition mutex poisoned")
            .insert(
                execution_id,
                TerminalRecord {
                    execution_id,
                    final_status,
                    node_outputs,
                    recorded_at: Utc::now(),
                },
            );
        Ok(())
    }

    async fn load_terminal(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<TerminalRecord>, StateError> {
        Ok(self
            .terminals
            .lock()
            .expect("definition mutex poisoned")
            .get(&execution_id)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Uuid>, StateError> {
        let mut ids: Vec<Uuid> = self
            .workflows
            .lock()
            .expect("definition mutex poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Filesystem-backed definition store. Writes are atomic
/// (tmp-then-rename under an advisory lock), so concurrent submitters
/// cannot interleave partial definitions.
#[derive(Debug, Clone)]
pub struct LocalFsDefinitionStore {
    base_dir: PathBuf,
}

impl LocalFsDefinitionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn workflow_key(workflow_id: Uuid) -> String {
        format!("workflows/{workflow_id}.json")
    }

    fn terminal_key(execution_id: Uuid) -> String {
        format!("executions/{execution_id}.json")
    }
}

#[async_trait]
impl DefinitionStore for LocalFsDefinitionStore {
    async fn save_dag(&self, definition: &WorkflowDefinition) -> Result<(), StateError> {
        let base_dir = self.base_dir.clone();
        let key = Self::workflow_key(definition.workflow_id);
        let body = serde_json::to_vec_pretty(definition)
            .map_err(|e| StateError::Serde(e.to_string()))?;
        run_blocking(move || {
            with_key_lock(&base_dir, &key, |path| {
                if path.exists() {
                    return Err(StateError::AlreadyExists(key.clone()));
                }
                atomic_write(&path, &body)
            })
        })
        .await
    }

    async fn load_dag(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StateError> {
        let base_dir = self.base_dir.clone();
        let key = Self::workflow_key(workflow_id);
        let body = run_blocking(move || {
            let path = key_to_path(&base_dir, &key)?;
            if !path.exists() {
                return Err(StateError::NotFound(key));
            }
            fs::read(&path).map(Bytes::from).map_err(io_err)
        })
        .await?;
        serde_json::from_slice(&body).map_err(|e| StateError::Serde(e.to_string()))
    }

    async fn record_terminal(
        &self,
        execution_id: Uuid,
        final_status: ExecutionStatus,
        node_outputs: HashMap<String, Value>,
    ) -> Result<(), StateError> {
        let record = TerminalRecord {
            execution_id,
            final_status,
            node_outputs,
            recorded_at: Utc::now(),
        };
        let body =
            serde_json::to_vec_pretty(&record).map_err(|e| StateError::Serde(e.to_string()))?;
        let base_dir = self.base_dir.clone();
        let key = Self::terminal_key(execution_id);
        run_blocking(move || with_key_lock(&base_dir, &key, |path| atomic_write(&path, &body)))
            .await
    }

    async fn load_terminal(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<TerminalRecord>, StateError> {
        let base_dir = self.base_dir.clone();
        let key = Self::terminal_key(execution_id);
        let body = run_blocking(move || {
            let path = key_to_path(&base_dir, &key)?;
            if !path.exists() {
                return Ok(None);
            }
            fs::read(&path).map(|body| Some(Bytes::from(body))).map_err(io_err)
        })
        .await?;
        match body {
            Some(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| StateError::Serde(e.to_string())),
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Uuid>, StateError> {
        let base_dir = self.base_dir.join("workflows");
        run_blocking(move || {
            if !base_dir.exists() {
                return Ok(Vec::new());
            }
            let mut ids = Vec::new();
            for entry in WalkDir::new(&base_dir) {
                let entry = entry.map_err(|e| StateError::Io(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(id) = stem.parse::<Uuid>() {
                    ids.push(id);
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, StateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StateError> + Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| StateError::Other(format!("blocking task join error: {e}")))?
}

fn key_to_path(base_dir: &Path, key: &str) -> Result<PathBuf, StateError> {
    if key.is_empty() {
        return Err(StateError::Other("key cannot be empty".to_string()));
    }
    let key_path = Path::new(key);
    for component in key_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StateError::Other(format!("invalid key path: {key}")));
            }
        }
    }
    Ok(base_dir.join(key_path))
}

fn with_key_lock<T, F>(base_dir: &Path, key: &str, f: F) -> Result<T, StateError>
where
    F: FnOnce(PathBuf) -> Result<T, StateError>,
{
    let path = key_to_path(base_dir, key)?;
    let lock_path = PathBuf::from(format!("{}.lock", path.to_string_lossy()));
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(io_err)?;
    lock_exclusive(&file)?;
    let result = f(path);
    unlock(&file)?;
    result
}

fn lock_exclusive(file: &File) -> Result<(), StateError> {
    file.lock_exclusive().map_err(io_err)
}

fn unlock(file: &File) -> Result<(), StateError> {
    FileExt::unlock(file).map_err(io_err)
}

fn atomic_write(path: &Path, body: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = PathBuf::from(format!("{}.tmp-{}", path.to_string_lossy(), Uuid::new_v4()));
    fs::write(&tmp, body).map_err(io_err)?;
    if path.exists() {
        fs::remove_file(path).map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn io_err(error: std::io::Error) -> StateError {
    StateError::Io(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::model::NodeSpec;
    use tempfile::tempdir;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "pipeline",
            vec![NodeSpec {
                id: "fetch".to_string(),
                handler: "call_external_service".to_string(),
                config: json!({"url": "https://a.test"}),
                dependencies: Vec::new(),
                condition: None,
            }],
        )
    }

    #[tokio::test]
    async fn memory_store_saves_once_and_loads() {
        let store = MemoryDefinitionStore::new();
        let def = definition();
        store.save_dag(&def).await.expect("save");

        let err = store.save_dag(&def).await.expect_err("duplicate save");
        assert!(matches!(err, StateError::AlreadyExists(_)));

        let loaded = store.load_dag(def.workflow_id).await.expect("load");
        assert_eq!(loaded, def);
        assert_eq!(store.list_workflows().await.expect("list"), vec![def.workflow_id]);
    }

    #[tokio::test]
    async fn local_fs_round_trips_definitions_and_terminals() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsDefinitionStore::new(temp.path());
        let def = definition();

        store.save_dag(&def).await.expect("save");
        let err = store.save_dag(&def).await.expect_err("duplicate save");
        assert!(matches!(err, StateError::AlreadyExists(_)));

        let loaded = store.load_dag(def.workflow_id).await.expect("load");
        assert_eq!(loaded, def);

        let missing = store.load_dag(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(missing, StateError::NotFound(_)));

        let execution_id = Uuid::now_v7();
        let outputs = HashMap::from([("fetch".to_string(), json!({"v": 1}))]);
        store
            .record_terminal(execution_id, ExecutionStatus::Completed, outputs.clone())
            .await
            .expect("record terminal");

        let terminal = store
            .load_terminal(execution_id)
            .await
            .expect("load terminal")
            .expect("terminal exists");
        assert_eq!(terminal.final_status, ExecutionStatus::Completed);
        assert_eq!(terminal.node_outputs, outputs);

        assert_eq!(
            store.list_workflows().await.expect("list"),
            vec![def.workflow_id]
        );
    }

    #[tokio::test]
    async fn unknown_terminal_is_none() {
        let temp = tempdir().expect("create temp dir");
        let store = LocalFsDefinitionStore::new(temp.path());
        assert!(
            store
                .load_terminal(Uuid::now_v7())
                .await
                .expect("load")
                .is_none()
        );
    }
}
