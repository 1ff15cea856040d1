//! Persistent reporter state.
//!
//! The only thing kept across restarts is a random per-install salt, stored
//! as JSON with the salt base64-encoded.

use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Length of the per-install salt in bytes.
pub const SALT_LEN: usize = 32;

/// Byte storage for the reporter state.
pub trait PersistentStore: Send + Sync {
    /// Returns the stored bytes, or `None` if nothing was saved yet.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    fn save(&self, data: &[u8]) -> io::Result<()>;
}

/// Stores the state in a single file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentStore for FileStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, data: &[u8]) -> io::Result<()> {
        fs::write(&self.path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// In-memory store, for tests and for embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, data: &[u8]) -> io::Result<()> {
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(data.to_vec());
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct ReporterState {
    salt: String,
}

fn decode_state(data: &[u8]) -> io::Result<Vec<u8>> {
    let state: ReporterState =
        serde_json::from_slice(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let salt = general_purpose::STANDARD
        .decode(state.salt.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if salt.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty salt"));
    }
    Ok(salt)
}

/// Loads the salt from `store`, creating and saving a fresh one if the store
/// is empty or holds unreadable state.
pub fn load_or_create_salt(store: &dyn PersistentStore) -> io::Result<Vec<u8>> {
    if let Some(data) = store.load()? {
        match decode_state(&data) {
            Ok(salt) => return Ok(salt),
            Err(e) => tracing::warn!(error = %e, "Discarding unreadable reporter state"),
        }
    }

    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let state = ReporterState { salt: general_purpose::STANDARD.encode(&salt) };
    let json = serde_json::to_vec_pretty(&state)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    store.save(&json)?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_is_stable() {
        let store = MemoryStore::new();
        let first = load_or_create_salt(&store).unwrap();
        assert_eq!(first.len(), SALT_LEN);
        let second = load_or_create_salt(&store).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_state_is_json() {
        let store = MemoryStore::new();
        let salt = load_or_create_salt(&store).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&store.contents().unwrap()).unwrap();
        let encoded = json["salt"].as_str().unwrap();
        assert_eq!(general_purpose::STANDARD.decode(encoded).unwrap(), salt);
    }

    #[test]
    fn test_garbage_state_replaced() {
        let store = MemoryStore::new();
        store.save(b"not json").unwrap();
        let salt = load_or_create_salt(&store).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
        assert_eq!(load_or_create_salt(&store).unwrap(), salt);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("reporter.json"));
        assert!(store.load().unwrap().is_none());

        let salt = load_or_create_salt(&store).unwrap();
        let reopened = FileStore::new(store.path());
        assert_eq!(load_or_create_salt(&reopened).unwrap(), salt);
    }
}
