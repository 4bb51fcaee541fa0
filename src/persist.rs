//! Durable storage for the term and vote.
//!
//! The node treats the stored bytes as opaque and hands them to a
//! [`Persister`]; only [`PersistentState::encode`]/[`PersistentState::decode`]
//! know the format.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// State that must survive a restart before it is allowed to affect replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

pub trait Persister: Send + Sync {
    fn save(&self, state: &[u8]) -> Result<()>;

    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// In-memory persister. Clones share the same storage, so a node rebuilt
/// from a clone sees what its predecessor saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: &[u8]) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| RaftError::Persistence("persister lock poisoned".to_string()))?;
        *data = Some(state.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .lock()
            .map_err(|_| RaftError::Persistence("persister lock poisoned".to_string()))?;
        Ok(data.clone())
    }
}

/// File-backed persister. Writes go to a sibling temp file that is then
/// renamed over the target, so a crash never leaves a torn state file.
#[derive(Debug, Clone)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persister for `node_id` inside `dir`.
    pub fn in_dir(dir: &Path, node_id: u64) -> Self {
        Self::new(dir.join(format!("node-{}.state", node_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persister for FilePersister {
    fn save(&self, state: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, state)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
