//! Persistence of the last successfully connected device

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use log::{info, warn};
use tokio::fs;

use crate::core::bluetooth::types::LastDeviceRecord;
use crate::utils::ensure_directory_exists;

#[async_trait::async_trait]
pub trait LastDeviceStore: Send + Sync {
    async fn load(&self) -> Result<Option<LastDeviceRecord>>;

    async fn save(&self, record: &LastDeviceRecord) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Stores the record as a small JSON file
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl LastDeviceStore for JsonFileStore {
    async fn load(&self) -> Result<Option<LastDeviceRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path).await?;
        match serde_json::from_str(&json) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record only costs one silent reconnect.
                warn!("Ignoring unreadable last device record {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &LastDeviceRecord) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            ensure_directory_exists(dir).await?;
        }
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&self.path, json).await?;
        info!("Last device record saved: {} ({})", record.name, record.id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).await?;
            info!("Last device record cleared.");
        }
        Ok(())
    }
}

/// In-process store, for shells that persist the record themselves
#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<Option<LastDeviceRecord>>,
}

impl MemoryStore {
    pub fn with_record(record: LastDeviceRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    pub fn current(&self) -> Option<LastDeviceRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl LastDeviceStore for MemoryStore {
    async fn load(&self) -> Result<Option<LastDeviceRecord>> {
        Ok(self.current())
    }

    async fn save(&self, record: &LastDeviceRecord) -> Result<()> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
