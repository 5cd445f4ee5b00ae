//! Settings store implementations.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::traits::{SettingsError, SettingsStore};

/// In-memory settings.
///
/// Useful for tests and ephemeral sessions. Data is lost on exit.
///
/// ```rust
/// use pinchy_core::{SettingsStore, settings::MemorySettings};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let settings = MemorySettings::new();
/// settings.set("gatewayUrl", json!("ws://127.0.0.1:18789")).await.unwrap();
/// assert_eq!(
///     settings.get("gatewayUrl").await.unwrap(),
///     Some(json!("ws://127.0.0.1:18789"))
/// );
///
/// settings.delete("gatewayUrl").await.unwrap();
/// assert_eq!(settings.get("gatewayUrl").await.unwrap(), None);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        self.values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Settings persisted as one JSON object on disk.
///
/// Writes go through a temporary file and a rename so a crash never
/// leaves a half-written file behind.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    // Serialises read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonFileSettings {
    /// Use a specific file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Use `<config dir>/pinchy/config.json`.
    ///
    /// # Errors
    /// Returns error if the platform has no configuration directory.
    pub fn in_config_dir() -> Result<Self, SettingsError> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(Self::new(dir.join("pinchy").join("config.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Map<String, Value>, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, values: &Map<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(values)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettings {
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.to_string(), value);
        self.store(&values).await
    }

    async fn delete(&self, key: &str) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        if values.remove(key).is_some() {
            self.store(&values).await?;
        }
        Ok(())
    }
}
