//! Persisted plugin registry
//!
//! Synchronous key-value store of [`PluginInfo`] keyed by plugin id.
//! `flush_to_disk` is the commit point: callers mutate, then flush.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::model::PluginInfo;

/// Registry contract used by the lifecycle, permission and install paths
pub trait PluginRegistry: Send + Sync {
    fn get_plugin_by_id(&self, plugin_id: &str) -> PluginResult<Option<PluginInfo>>;

    fn get_all_plugins(&self) -> PluginResult<Vec<PluginInfo>>;

    /// Replace an existing record; fails if the id is unknown
    fn update_plugin(&self, info: PluginInfo) -> PluginResult<()>;

    /// Insert or replace a record
    fn add_plugin(&self, info: PluginInfo) -> PluginResult<()>;

    /// Remove a record, returning whether it existed
    fn remove_plugin(&self, plugin_id: &str) -> PluginResult<bool>;

    fn flush_to_disk(&self) -> PluginResult<()>;
}

/// Registry without persistence
#[derive(Debug, Default)]
pub struct InMemoryPluginRegistry {
    plugins: RwLock<BTreeMap<String, PluginInfo>>,
}

impl InMemoryPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins(plugins: impl IntoIterator<Item = PluginInfo>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.plugins.write();
            for info in plugins {
                map.insert(info.id.clone(), info);
            }
        }
        registry
    }
}

impl PluginRegistry for InMemoryPluginRegistry {
    fn get_plugin_by_id(&self, plugin_id: &str) -> PluginResult<Option<PluginInfo>> {
        Ok(self.plugins.read().get(plugin_id).cloned())
    }

    fn get_all_plugins(&self) -> PluginResult<Vec<PluginInfo>> {
        Ok(self.plugins.read().values().cloned().collect())
    }

    fn update_plugin(&self, info: PluginInfo) -> PluginResult<()> {
        let mut plugins = self.plugins.write();
        match plugins.get_mut(&info.id) {
            Some(existing) => {
                *existing = info;
                Ok(())
            }
            None => Err(PluginRuntimeError::PluginNotFound(info.id)),
        }
    }

    fn add_plugin(&self, info: PluginInfo) -> PluginResult<()> {
        self.plugins.write().insert(info.id.clone(), info);
        Ok(())
    }

    fn remove_plugin(&self, plugin_id: &str) -> PluginResult<bool> {
        Ok(self.plugins.write().remove(plugin_id).is_some())
    }

    fn flush_to_disk(&self) -> PluginResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    plugins: Vec<PluginInfo>,
}

/// Registry persisted as a JSON document.
///
/// Mutations stay in memory until [`PluginRegistry::flush_to_disk`], which
/// writes a sibling temp file and renames it over the registry file.
#[derive(Debug)]
pub struct JsonFilePluginRegistry {
    path: PathBuf,
    inner: InMemoryPluginRegistry,
}

impl JsonFilePluginRegistry {
    /// Open a registry file, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let plugins = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let document: RegistryDocument = serde_json::from_str(&raw).map_err(|e| {
                PluginRuntimeError::RegistryError(format!(
                    "failed to parse registry {}: {}",
                    path.display(),
                    e
                ))
            })?;
            document.plugins
        } else {
            Vec::new()
        };

        info!(path = %path.display(), count = plugins.len(), "opened plugin registry");

        Ok(Self {
            path,
            inner: InMemoryPluginRegistry::with_plugins(plugins),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PluginRegistry for JsonFilePluginRegistry {
    fn get_plugin_by_id(&self, plugin_id: &str) -> PluginResult<Option<PluginInfo>> {
        self.inner.get_plugin_by_id(plugin_id)
    }

    fn get_all_plugins(&self) -> PluginResult<Vec<PluginInfo>> {
        self.inner.get_all_plugins()
    }

    fn update_plugin(&self, info: PluginInfo) -> PluginResult<()> {
        self.inner.update_plugin(info)
    }

    fn add_plugin(&self, info: PluginInfo) -> PluginResult<()> {
        self.inner.add_plugin(info)
    }

    fn remove_plugin(&self, plugin_id: &str) -> PluginResult<bool> {
        self.inner.remove_plugin(plugin_id)
    }

    fn flush_to_disk(&self) -> PluginResult<()> {
        let document = RegistryDocument {
            plugins: self.inner.get_all_plugins()?,
        };
        let json = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            PluginRuntimeError::RegistryError(format!(
                "failed to commit registry {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!(path = %self.path.display(), count = document.plugins.len(), "registry flushed");
        Ok(())
    }
}
