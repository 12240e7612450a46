//! Provider-side session persistence.
//!
//! The session manager never persists anything itself; surviving a restart is
//! the provider client's job. Sessions are kept either in memory or as a JSON
//! file on disk.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::fs;
use tracing::warn;

use super::types::Session;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("session file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub enum SessionStorage {
    Memory(Mutex<Option<Session>>),
    File(PathBuf),
}

impl SessionStorage {
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(Mutex::new(None))
    }

    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Load the stored session. A corrupt file is treated as absent (and
    /// removed) rather than failing every later session read.
    pub async fn load(&self) -> Result<Option<Session>, StorageError> {
        match self {
            Self::Memory(slot) => Ok(lock(slot).clone()),
            Self::File(path) => load_file(path).await,
        }
    }

    pub async fn save(&self, session: &Session) -> Result<(), StorageError> {
        match self {
            Self::Memory(slot) => {
                *lock(slot) = Some(session.clone());
                Ok(())
            }
            Self::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).await?;
                }
                let json = serde_json::to_vec_pretty(session)?;
                fs::write(path, json).await?;
                Ok(())
            }
        }
    }

    /// Remove any stored session. Missing storage is not an error.
    pub async fn clear(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(slot) => {
                *lock(slot) = None;
                Ok(())
            }
            Self::File(path) => match fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

fn lock(slot: &Mutex<Option<Session>>) -> std::sync::MutexGuard<'_, Option<Session>> {
    slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn load_file(path: &Path) -> Result<Option<Session>, StorageError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(session) => Ok(Some(session)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable session file");
            if let Err(e) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove unreadable session file");
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
