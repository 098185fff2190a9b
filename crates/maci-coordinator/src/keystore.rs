//! small string key-value store for the local maci key
//!
//! holds the serialized private key and the wallet address it was derived
//! for, so a switched account can invalidate the stored key.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// serialized maci private key
pub const KEY_PRIVATE_KEY: &str = "maciPrivateKey";
/// wallet address the stored key belongs to
pub const KEY_ADDRESS: &str = "address";

pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// on-disk store backed by sled
pub struct FileKeyStore {
    db: sled::Db,
}

impl FileKeyStore {
    /// open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("opening key store at {}", path.display());
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| Error::KeyStore(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.db.remove(key.as_bytes())?.is_some() {
            self.db.flush()?;
        }
        Ok(())
    }
}
