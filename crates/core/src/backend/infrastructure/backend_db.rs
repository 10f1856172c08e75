use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::backend::domain::worker_state::WorkerState;
use crate::shared::constants::{APP_DIR_NAME, BACKEND_DB_FILENAME};

#[derive(Error, Debug)]
pub enum BackendDbError {
    #[error("failed to write backend db {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize backend db: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One JSON file per installation holding a [`WorkerState`] per stage name.
///
/// Every save rewrites the whole file through a temp file and rename, so a
/// crash mid-write never leaves a truncated database behind.
pub struct BackendDb {
    path: PathBuf,
    states: Mutex<BTreeMap<String, WorkerState>>,
}

impl BackendDb {
    /// Opens the database at `path`. A missing or unreadable file starts empty.
    pub fn open(path: &Path) -> Self {
        let states = fs::read_to_string(path)
            .ok()
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(states) => Some(states),
                Err(e) => {
                    log::warn!("Ignoring corrupt backend db {}: {e}", path.display());
                    None
                }
            })
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            states: Mutex::new(states),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(BACKEND_DB_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, stage: &str) -> Option<WorkerState> {
        self.lock().get(stage).cloned()
    }

    pub fn save(&self, stage: &str, state: &WorkerState) -> Result<(), BackendDbError> {
        let mut states = self.lock();
        states.insert(stage.to_string(), state.clone());
        self.flush(&states)
    }

    pub fn remove(&self, stage: &str) -> Result<bool, BackendDbError> {
        let mut states = self.lock();
        let removed = states.remove(stage).is_some();
        if removed {
            self.flush(&states)?;
        }
        Ok(removed)
    }

    /// Wipes every stage's state ("reset all module settings").
    pub fn clear(&self) -> Result<(), BackendDbError> {
        let mut states = self.lock();
        states.clear();
        self.flush(&states)
    }

    pub fn stages(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn flush(&self, states: &BTreeMap<String, WorkerState>) -> Result<(), BackendDbError> {
        let json = serde_json::to_string_pretty(states)?;
        let write_err = |source: std::io::Error| BackendDbError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(write_err)?;
        fs::rename(&temp_path, &self.path).map_err(write_err)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, WorkerState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}
