use crate::descriptor::AgentDescriptor;
use crate::workflow::WorkflowExecution;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use switchyard_core::{SwitchyardError, SwitchyardResult};
use uuid::Uuid;

/// Durable storage for agent descriptors and workflow executions.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_agent(&self, descriptor: &AgentDescriptor) -> SwitchyardResult<()>;
    async fn load_agent(&self, id: Uuid) -> SwitchyardResult<Option<AgentDescriptor>>;
    async fn delete_agent(&self, id: Uuid) -> SwitchyardResult<()>;
    async fn list_agents(&self) -> SwitchyardResult<Vec<AgentDescriptor>>;

    async fn save_execution(&self, execution: &WorkflowExecution) -> SwitchyardResult<()>;
    async fn load_execution(&self, id: Uuid) -> SwitchyardResult<Option<WorkflowExecution>>;
    async fn list_executions(&self) -> SwitchyardResult<Vec<WorkflowExecution>>;
}

/// One pretty-printed JSON file per record under `agents/` and `executions/`.
pub struct FileStateStore {
    agents: PathBuf,
    executions: PathBuf,
}

impl FileStateStore {
    pub async fn new(dir: impl Into<PathBuf>) -> SwitchyardResult<Self> {
        let dir = dir.into();
        let agents = dir.join("agents");
        let executions = dir.join("executions");
        tokio::fs::create_dir_all(&agents).await?;
        tokio::fs::create_dir_all(&executions).await?;
        Ok(Self { agents, executions })
    }

    fn record_path(dir: &Path, id: Uuid) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    async fn write<T: Serialize + Sync>(dir: &Path, id: Uuid, value: &T) -> SwitchyardResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        // Write then rename so a crash never leaves a half-written record.
        let tmp = dir.join(format!("{id}.json.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, Self::record_path(dir, id)).await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(dir: &Path, id: Uuid) -> SwitchyardResult<Option<T>> {
        let path = Self::record_path(dir, id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&data).map_err(|e| {
            SwitchyardError::Fatal(format!("corrupt state file {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    async fn read_all<T: DeserializeOwned>(dir: &Path) -> SwitchyardResult<Vec<T>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = Self::read(dir, id).await? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_agent(&self, descriptor: &AgentDescriptor) -> SwitchyardResult<()> {
        Self::write(&self.agents, descriptor.id, descriptor).await
    }

    async fn load_agent(&self, id: Uuid) -> SwitchyardResult<Option<AgentDescriptor>> {
        Self::read(&self.agents, id).await
    }

    async fn delete_agent(&self, id: Uuid) -> SwitchyardResult<()> {
        let path = Self::record_path(&self.agents, id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list_agents(&self) -> SwitchyardResult<Vec<AgentDescriptor>> {
        Self::read_all(&self.agents).await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> SwitchyardResult<()> {
        Self::write(&self.executions, execution.id, execution).await
    }

    async fn load_execution(&self, id: Uuid) -> SwitchyardResult<Option<WorkflowExecution>> {
        Self::read(&self.executions, id).await
    }

    async fn list_executions(&self) -> SwitchyardResult<Vec<WorkflowExecution>> {
        Self::read_all(&self.executions).await
    }
}
