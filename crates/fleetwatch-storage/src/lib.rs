//! Best-effort persistence for agent state: one JSON file per agent under a
//! data directory. Consumers reach it only through the narrow [`Storage`]
//! trait; failures are reported as errors here and downgraded to log lines by
//! the callers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use fleetwatch_core::telemetry::TelemetryRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The durable form of one agent: identity, last contact, bounded history.
/// Liveness is not persisted; it is recomputed from `last_seen` on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedAgent {
    pub server_name: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub data_history: Vec<TelemetryRecord>,
}

pub trait Storage: Send + Sync {
    fn save(&self, agent: &PersistedAgent) -> Result<(), StorageError>;
    fn load_all(&self) -> Result<Vec<PersistedAgent>, StorageError>;
}

pub struct JsonFileStorage {
    data_dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ensure_data_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    fn agent_path(&self, server_name: &str) -> PathBuf {
        let safe_name: String = server_name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.data_dir.join(format!("{safe_name}.json"))
    }

    pub fn load(&self, server_name: &str) -> Result<Option<PersistedAgent>, StorageError> {
        let path = self.agent_path(server_name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let agent = serde_json::from_slice(&bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(Some(agent))
    }
}

impl Storage for JsonFileStorage {
    fn save(&self, agent: &PersistedAgent) -> Result<(), StorageError> {
        self.ensure_data_dir()?;
        let encoded = serde_json::to_vec_pretty(agent)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let path = self.agent_path(&agent.server_name);
        fs::write(&path, encoded)?;
        debug!(event = "agent_saved", server = %agent.server_name, path = %path.display());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedAgent>, StorageError> {
        self.ensure_data_dir()?;

        let mut agents = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            // One corrupt file must not take down the rest of the fleet state.
            let agent = match fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<PersistedAgent>(&bytes)
                        .map_err(|err| StorageError::Serialization(err.to_string()))
                }) {
                Ok(agent) => agent,
                Err(err) => {
                    warn!(event = "agent_load_skipped", path = %path.display(), error = %err);
                    continue;
                }
            };
            agents.push(agent);
        }
        Ok(agents)
    }
}
