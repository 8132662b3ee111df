//! Plugin runtime error types
//!
//! Every internal step reports through [`PluginRuntimeError`]. Public
//! lifecycle operations collapse these into boolean or count outcomes at the
//! call boundary; the installer keeps the message as a user-facing reason.

use std::fmt;
use thiserror::Error;

/// Main plugin runtime error type
#[derive(Error, Debug)]
pub enum PluginRuntimeError {
    /// Plugin not found in the installed registry
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Invalid plugin state for operation
    #[error("Invalid plugin state: {0}")]
    InvalidState(String),

    /// Module could not be turned into a loader
    #[error("Plugin loading failed for {plugin_id}: {reason}")]
    LoadingFailed {
        /// Plugin being loaded
        plugin_id: String,
        /// Failure description
        reason: String,
    },

    /// The module does not expose the declared entry point
    #[error("Entry point '{entry_point}' not found in plugin {plugin_id}")]
    EntryPointMissing {
        /// Plugin being instantiated
        plugin_id: String,
        /// Declared entry point symbol
        entry_point: String,
    },

    /// A symbol is already owned by another loaded plugin
    #[error("Symbol '{symbol}' requested by {plugin_id} is already owned by {owner}")]
    SymbolConflict {
        /// Symbol name
        symbol: String,
        /// Plugin trying to register it
        plugin_id: String,
        /// Current owner
        owner: String,
    },

    /// Plugin code referenced a symbol that no loaded plugin provides
    #[error("Plugin {culprit} is missing dependency symbol '{symbol}'")]
    DependencyMissing {
        /// Plugin whose code needed the symbol
        culprit: String,
        /// Symbol that could not be resolved
        symbol: String,
    },

    /// Plugin code used an instance created by a previous loader generation
    #[error("Stale or mismatched instance: {0}")]
    StaleInstance(String),

    /// Plugin resource lookup failed
    #[error("Plugin resource not found: {0}")]
    ResourceNotFound(String),

    /// Plugin was built against an incompatible host API
    #[error("Plugin API incompatible: {0}")]
    ApiIncompatible(String),

    /// Caller lacks the permission for an operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Installation step failed
    #[error("Installation failed: {0}")]
    InstallationFailed(String),

    /// Invalid plugin manifest
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Persisted registry could not be read or written
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Runtime initialization failed
    #[error("Runtime initialization failed: {0}")]
    InitializationFailed(String),

    /// Plugin execution failed
    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Plugin runtime result type
pub type PluginResult<T> = Result<T, PluginRuntimeError>;

impl PluginRuntimeError {
    /// Shorthand for [`PluginRuntimeError::LoadingFailed`]
    pub fn loading(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadingFailed {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is considered critical
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::InitializationFailed(_) | Self::RegistryError(_) | Self::SymbolConflict { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PluginNotFound(_) => ErrorCategory::NotFound,
            Self::InvalidState(_) => ErrorCategory::State,
            Self::LoadingFailed { .. } | Self::EntryPointMissing { .. } => ErrorCategory::Loading,
            Self::SymbolConflict { .. } => ErrorCategory::Index,
            Self::DependencyMissing { .. }
            | Self::StaleInstance(_)
            | Self::ResourceNotFound(_)
            | Self::ApiIncompatible(_)
            | Self::ExecutionFailed(_) => ErrorCategory::Execution,
            Self::PermissionDenied(_) => ErrorCategory::Security,
            Self::InstallationFailed(_) => ErrorCategory::Installation,
            Self::InvalidManifest(_) | Self::ConfigurationError(_) => ErrorCategory::Configuration,
            Self::RegistryError(_) => ErrorCategory::Registry,
            Self::InitializationFailed(_) => ErrorCategory::Initialization,
            Self::IoError(_) => ErrorCategory::Io,
            Self::JsonError(_) => ErrorCategory::Serialization,
        }
    }
}

/// Error category enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Not found errors
    NotFound,
    /// State management errors
    State,
    /// Loading errors
    Loading,
    /// Module index errors
    Index,
    /// Errors raised by plugin code at runtime
    Execution,
    /// Permission errors
    Security,
    /// Installation errors
    Installation,
    /// Configuration errors
    Configuration,
    /// Persisted registry errors
    Registry,
    /// Initialization errors
    Initialization,
    /// I/O errors
    Io,
    /// Serialization errors
    Serialization,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::State => write!(f, "state"),
            Self::Loading => write!(f, "loading"),
            Self::Index => write!(f, "index"),
            Self::Execution => write!(f, "execution"),
            Self::Security => write!(f, "security"),
            Self::Installation => write!(f, "installation"),
            Self::Configuration => write!(f, "configuration"),
            Self::Registry => write!(f, "registry"),
            Self::Initialization => write!(f, "initialization"),
            Self::Io => write!(f, "io"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = PluginRuntimeError::loading("p1", "missing file");
        assert_eq!(err.category(), ErrorCategory::Loading);
        assert_eq!(err.to_string(), "Plugin loading failed for p1: missing file");

        let conflict = PluginRuntimeError::SymbolConflict {
            symbol: "a::B".to_string(),
            plugin_id: "p2".to_string(),
            owner: "p1".to_string(),
        };
        assert!(conflict.is_critical());
        assert_eq!(conflict.category().to_string(), "index");
    }
}
