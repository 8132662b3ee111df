//! Resource overlay boundary
//!
//! Tracks which plugin's resources are mounted into the host. The overlay
//! mechanics themselves are host specific.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PluginResult, PluginRuntimeError};

pub trait ResourceOverlay: Send + Sync {
    fn load_plugin_resources(&self, plugin_id: &str, module_path: &Path) -> PluginResult<()>;

    /// Release the overlay of `plugin_id`; a missing overlay is ignored
    fn remove_plugin_resources(&self, plugin_id: &str);
}

/// Resource roots keyed by plugin id
#[derive(Debug, Default)]
pub struct ResourceTable {
    roots: DashMap<String, PathBuf>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_root(&self, plugin_id: &str) -> Option<PathBuf> {
        self.roots.get(plugin_id).map(|entry| entry.value().clone())
    }

    /// Resolve a resource file of a loaded plugin
    pub fn resolve(&self, plugin_id: &str, resource: &str) -> PluginResult<PathBuf> {
        let root = self.resource_root(plugin_id).ok_or_else(|| {
            PluginRuntimeError::ResourceNotFound(format!("no resources mounted for {}", plugin_id))
        })?;
        let path = root.join(resource);
        if path.exists() {
            Ok(path)
        } else {
            Err(PluginRuntimeError::ResourceNotFound(format!(
                "{} in plugin {}",
                resource, plugin_id
            )))
        }
    }
}

impl ResourceOverlay for ResourceTable {
    fn load_plugin_resources(&self, plugin_id: &str, module_path: &Path) -> PluginResult<()> {
        let root = module_path
            .parent()
            .map(|dir| dir.join("resources"))
            .unwrap_or_else(|| PathBuf::from("resources"));
        debug!(plugin_id, root = %root.display(), "mounted plugin resources");
        self.roots.insert(plugin_id.to_string(), root);
        Ok(())
    }

    fn remove_plugin_resources(&self, plugin_id: &str) {
        self.roots.remove(plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_resource() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        std::fs::write(dir.path().join("resources/strings.json"), b"{}").unwrap();

        let table = ResourceTable::new();
        table
            .load_plugin_resources("p1", &dir.path().join("module.so"))
            .unwrap();

        assert!(table.resolve("p1", "strings.json").is_ok());
        assert!(matches!(
            table.resolve("p1", "missing.png"),
            Err(PluginRuntimeError::ResourceNotFound(_))
        ));

        table.remove_plugin_resources("p1");
        assert!(table.resolve("p1", "strings.json").is_err());
    }
}
