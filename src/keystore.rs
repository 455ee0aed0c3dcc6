//! Secret Key Persistence
//!
//! The node consumes secret storage through the `SecretStore` trait so the
//! host platform can supply its own keychain. Two implementations ship with
//! the crate: an in-memory store for tests and embedding, and a file-backed
//! store that writes one hex-encoded file per key with owner-only
//! permissions.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur in secret store operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to read secret {key}: {source}")]
    Read { key: String, source: io::Error },

    #[error("failed to write secret {key}: {source}")]
    Write { key: String, source: io::Error },

    #[error("secret {key} is not valid hex")]
    Corrupt { key: String },

    #[error("invalid secret key name: {0}")]
    InvalidKeyName(String),
}

/// Key-value storage for secret material.
pub trait SecretStore: Send {
    /// Fetch a secret by name. Ok(None) when absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeyStoreError>;

    /// Store a secret under a name, replacing any previous value.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KeyStoreError>;
}

/// Volatile store for tests and hosts that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KeyStoreError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// File-backed store: one hex file per key under a directory.
#[derive(Debug)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Create a store rooted at `dir`. The directory is created on first
    /// write, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KeyStoreError> {
        // Key names are dotted identifiers; anything that could traverse
        // the filesystem is rejected.
        if key.is_empty()
            || key.contains(std::path::is_separator)
            || key.contains("..")
        {
            return Err(KeyStoreError::InvalidKeyName(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

impl SecretStore for FileKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        let path = self.path_for(key)?;
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KeyStoreError::Read {
                    key: key.to_string(),
                    source: e,
                })
            }
        };

        hex::decode(contents.trim())
            .map(Some)
            .map_err(|_| KeyStoreError::Corrupt {
                key: key.to_string(),
            })
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KeyStoreError> {
        let path = self.path_for(key)?;
        let wrap = |source| KeyStoreError::Write {
            key: key.to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(wrap)?;
        fs::write(&path, hex::encode(value)).map_err(wrap)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(wrap)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryKeyStore::new();
        assert!(store.get("mesh.privateKey").unwrap().is_none());

        store.put("mesh.privateKey", &[1, 2, 3]).unwrap();
        assert_eq!(store.get("mesh.privateKey").unwrap().unwrap(), vec![1, 2, 3]);

        store.put("mesh.privateKey", &[4, 5]).unwrap();
        assert_eq!(store.get("mesh.privateKey").unwrap().unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FileKeyStore::new(dir.path());

        assert!(store.get("mesh.signingKey").unwrap().is_none());
        store.put("mesh.signingKey", &[0xab; 32]).unwrap();
        assert_eq!(
            store.get("mesh.signingKey").unwrap().unwrap(),
            vec![0xab; 32]
        );
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileKeyStore::new(dir.path());
            store.put("mesh.privateKey", &[7; 32]).unwrap();
        }
        let store = FileKeyStore::new(dir.path());
        assert_eq!(store.get("mesh.privateKey").unwrap().unwrap(), vec![7; 32]);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let mut store = FileKeyStore::new(dir.path());
        store.put("mesh.privateKey", &[9; 32]).unwrap();

        let meta = std::fs::metadata(dir.path().join("mesh.privateKey")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_file_store_rejects_traversal() {
        let dir = tempdir().unwrap();
        let mut store = FileKeyStore::new(dir.path());
        assert!(matches!(
            store.put("../escape", &[1]),
            Err(KeyStoreError::InvalidKeyName(_))
        ));
        assert!(matches!(
            store.get("a/b"),
            Err(KeyStoreError::InvalidKeyName(_))
        ));
    }

    #[test]
    fn test_file_store_corrupt_contents() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("mesh.privateKey"), "not hex at all").unwrap();

        let store = FileKeyStore::new(dir.path());
        assert!(matches!(
            store.get("mesh.privateKey"),
            Err(KeyStoreError::Corrupt { .. })
        ));
    }
}
