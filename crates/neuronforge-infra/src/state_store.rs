//! File-backed store for exported execution state.
//!
//! One `<execution_id>.json` file per run under a directory. Writes go to a
//! temporary file first and are renamed into place.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use neuronforge_types::execution::ExportedState;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("no stored state for execution {0}")]
    NotFound(Uuid),

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: Uuid) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    /// Write `state`, replacing any earlier save of the same execution.
    pub async fn save(&self, state: &ExportedState) -> Result<PathBuf, StateStoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let id = state.state.execution_id;
        let path = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.json.tmp"));

        let body = serde_json::to_vec_pretty(state).map_err(StateStoreError::Encode)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(execution_id = %id, path = %path.display(), "saved execution state");
        Ok(path)
    }

    pub async fn load(&self, execution_id: Uuid) -> Result<ExportedState, StateStoreError> {
        let path = self.path_for(execution_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateStoreError::NotFound(execution_id));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StateStoreError::Corrupt { path, source })
    }

    /// Execution ids with a stored state, sorted. A missing directory is empty.
    pub async fn list(&self) -> Result<Vec<Uuid>, StateStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a stored state. Returns whether a file existed.
    pub async fn delete(&self, execution_id: Uuid) -> Result<bool, StateStoreError> {
        match tokio::fs::remove_file(self.path_for(execution_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
