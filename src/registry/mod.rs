use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::atomic::{quarantine, write_atomic};
use crate::error::RegistryError;
use crate::liveness::ProcessIdentity;

/// Lifecycle states of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl WorkerStatus {
    /// A live (or possibly live) process exists for this worker
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Stopping
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Last known state of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub name: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config_fingerprint: Option<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Identity hint captured at launch, guards against PID reuse
    #[serde(default)]
    pub identity: Option<ProcessIdentity>,
    #[serde(default)]
    pub launch_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl WorkerState {
    /// Default state of a worker that has never run
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: WorkerStatus::Stopped,
            pid: None,
            started_at: None,
            config_fingerprint: None,
            log_path: None,
            identity: None,
            launch_id: None,
            exit_code: None,
        }
    }

    /// Time since launch, only while running
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.started_at) {
            (WorkerStatus::Running, Some(started)) => {
                Some((now - started).max(chrono::Duration::zero()))
            }
            _ => None,
        }
    }
}

/// Durable record of worker state
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    async fn load_all(&self) -> Result<BTreeMap<String, WorkerState>, RegistryError>;

    async fn save(&self, state: &WorkerState) -> Result<(), RegistryError>;

    /// Save `next` only if the stored record still equals `expected`.
    /// Returns the record stored afterwards.
    async fn replace_if(
        &self,
        expected: &WorkerState,
        next: &WorkerState,
    ) -> Result<WorkerState, RegistryError>;

    /// Discard all records (used after the store was found corrupt)
    async fn reset(&self) -> Result<(), RegistryError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    workers: BTreeMap<String, WorkerState>,
}

const REGISTRY_VERSION: u32 = 1;

/// Registry persisted as a JSON file, rewritten atomically on every change
pub struct FileRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, WorkerState>, RegistryError> {
        let raw = match async_fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let file: RegistryFile =
            serde_json::from_slice(&raw).map_err(|e| RegistryError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if file.version != REGISTRY_VERSION {
            return Err(RegistryError::Corrupt {
                path: self.path.clone(),
                reason: format!("unsupported version {}", file.version),
            });
        }
        Ok(file.workers)
    }

    /// Current records, or none if the file is corrupt (which is quarantined)
    async fn read_or_fresh(&self) -> Result<BTreeMap<String, WorkerState>, RegistryError> {
        match self.read().await {
            Ok(workers) => Ok(workers),
            Err(RegistryError::Corrupt { reason, .. }) => {
                warn!("Registry unreadable ({}), starting a fresh one", reason);
                if let Err(e) = quarantine(&self.path).await {
                    warn!("Failed to quarantine registry {:?}: {}", self.path, e);
                }
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&self, workers: BTreeMap<String, WorkerState>) -> Result<(), RegistryError> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            workers,
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|e| RegistryError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &body)
            .await
            .map_err(|source| RegistryError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl ProcessRegistry for FileRegistry {
    async fn load_all(&self) -> Result<BTreeMap<String, WorkerState>, RegistryError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn save(&self, state: &WorkerState) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;

        let mut workers = self.read_or_fresh().await?;
        workers.insert(state.name.clone(), state.clone());
        self.write(workers).await?;
        debug!("Saved registry entry for {} ({})", state.name, state.status);
        Ok(())
    }

    async fn replace_if(
        &self,
        expected: &WorkerState,
        next: &WorkerState,
    ) -> Result<WorkerState, RegistryError> {
        let _guard = self.lock.lock().await;

        let mut workers = self.read_or_fresh().await?;
        match workers.get(&next.name) {
            Some(current) if current == expected => {}
            Some(current) => return Ok(current.clone()),
            None => return Ok(WorkerState::stopped(&next.name)),
        }
        workers.insert(next.name.clone(), next.clone());
        self.write(workers).await?;
        Ok(next.clone())
    }

    async fn reset(&self) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().await;
        if self.path.exists() {
            quarantine(&self.path)
                .await
                .map_err(|source| RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// In-memory registry for tests
#[derive(Default)]
pub struct MemoryRegistry {
    workers: StdMutex<BTreeMap<String, WorkerState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRegistry for MemoryRegistry {
    async fn load_all(&self) -> Result<BTreeMap<String, WorkerState>, RegistryError> {
        Ok(self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn save(&self, state: &WorkerState) -> Result<(), RegistryError> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn replace_if(
        &self,
        expected: &WorkerState,
        next: &WorkerState,
    ) -> Result<WorkerState, RegistryError> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        match workers.get(&next.name) {
            Some(current) if current == expected => {
                workers.insert(next.name.clone(), next.clone());
                Ok(next.clone())
            }
            Some(current) => Ok(current.clone()),
            None => Ok(WorkerState::stopped(&next.name)),
        }
    }

    async fn reset(&self) -> Result<(), RegistryError> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
