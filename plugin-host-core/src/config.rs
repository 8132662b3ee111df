//! Runtime configuration
//!
//! Loaded from an optional file and `PLUGIN_HOST_*` environment variables.
//! Nested keys use `__`, so `PLUGIN_HOST_VALIDATION_STRATEGY=insecure` and
//! `PLUGIN_HOST_HOST_SIGNATURES=ab12,cd34` both work.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::model::ValidationStrategy;

pub const ENV_PREFIX: &str = "PLUGIN_HOST";

/// Plugin runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuntimeConfig {
    /// Host name passed to plugins
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Root directory that holds one sub-directory per installed plugin
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// Persisted registry document
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,

    /// Host data directory handed to plugins
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Signature policy applied at install time
    #[serde(default)]
    pub validation_strategy: ValidationStrategy,

    /// SHA-256 hex digests of the host's signing certificates
    #[serde(default)]
    pub host_signatures: Vec<String>,

    /// Load every enabled plugin during initialization
    #[serde(default = "default_true")]
    pub load_enabled_on_start: bool,

    /// Install the panic hook that attributes crashes to plugins
    #[serde(default = "default_true")]
    pub install_crash_handler: bool,

    /// Relaunch the process after disabling a crashing plugin
    #[serde(default)]
    pub restart_on_crash: bool,
}

fn default_host_name() -> String {
    "plugin-host".to_string()
}

fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("plugins/registry.json")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            plugins_dir: default_plugins_dir(),
            registry_file: default_registry_file(),
            data_dir: default_data_dir(),
            validation_strategy: ValidationStrategy::default(),
            host_signatures: Vec::new(),
            load_enabled_on_start: true,
            install_crash_handler: true,
            restart_on_crash: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional file layered under the environment
    pub fn load(path: Option<&Path>) -> PluginResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("host_signatures"),
        );

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| PluginRuntimeError::ConfigurationError(e.to_string()))
    }

    /// Install directory for a plugin id
    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.validation_strategy, ValidationStrategy::Strict);
        assert!(config.load_enabled_on_start);
        assert_eq!(config.plugin_dir("p1"), PathBuf::from("plugins/p1"));
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin-host.json");
        std::fs::write(
            &path,
            r#"{ "host_name": "demo", "validation_strategy": "user_grant", "host_signatures": ["aa"] }"#,
        )
        .unwrap();

        let config = RuntimeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.host_name, "demo");
        assert_eq!(config.validation_strategy, ValidationStrategy::UserGrant);
        assert_eq!(config.host_signatures, vec!["aa".to_string()]);
        assert_eq!(config.plugins_dir, PathBuf::from("plugins"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = RuntimeConfig::load(Some(Path::new("/nonexistent/plugin-host.toml"))).unwrap();
        assert_eq!(config.registry_file, RuntimeConfig::default().registry_file);
    }
}
