//! Plugin data model
//!
//! Identity records persisted by the registry, the runtime-only pairing of a
//! record with its live loader, and the small value types shared between the
//! lifecycle, permission and crash components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::loader::ModuleLoader;
use crate::permission::PermissionLevel;

/// Plugin version: monotonic code plus display name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginVersion {
    /// Ordered version code, must increase on every upgrade
    pub code: u64,
    /// Human readable version
    pub name: String,
}

impl PluginVersion {
    pub fn new(code: u64, name: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
        }
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}

/// Static receiver or provider declared by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Fully-qualified component symbol
    pub name: String,
    /// Whether the component should be registered with the proxy layer
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Visible to other plugins
    #[serde(default)]
    pub exported: bool,
    /// Actions (receivers) or authorities (providers)
    #[serde(default)]
    pub actions: Vec<String>,
}

impl ComponentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            exported: false,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Persisted identity record of an installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Unique, stable plugin id
    pub id: String,
    /// Display name
    pub name: String,
    /// Description shown in authorization prompts
    #[serde(default)]
    pub description: String,
    /// Plugin version
    pub version: PluginVersion,
    /// On-disk module path
    pub path: PathBuf,
    /// Entry point symbol name
    pub entry_point: String,
    /// Loaded by `load_enabled_plugins`
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// First installation timestamp
    pub install_time: DateTime<Utc>,
    /// Declared dependency plugin ids
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Declared static receivers
    #[serde(default)]
    pub static_receivers: Vec<ComponentDescriptor>,
    /// Declared providers
    #[serde(default)]
    pub providers: Vec<ComponentDescriptor>,
}

impl PluginInfo {
    /// Minimal record, mostly useful for hosts that register plugins by hand
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: PluginVersion::new(1, "1.0.0"),
            path: path.into(),
            entry_point: entry_point.into(),
            enabled: true,
            install_time: Utc::now(),
            dependencies: Vec::new(),
            static_receivers: Vec::new(),
            providers: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: PluginVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    pub fn with_static_receiver(mut self, receiver: ComponentDescriptor) -> Self {
        self.static_receivers.push(receiver);
        self
    }

    pub fn with_provider(mut self, provider: ComponentDescriptor) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A plugin record paired with its live module loader.
///
/// Exists only while the plugin is loaded. The lifecycle manager owns it and
/// drops the loader on unload.
pub struct LoadedPlugin {
    pub info: PluginInfo,
    pub loader: Arc<dyn ModuleLoader>,
}

impl LoadedPlugin {
    pub fn new(info: PluginInfo, loader: Arc<dyn ModuleLoader>) -> Self {
        Self { info, loader }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.info.id)
            .field("version", &self.info.version)
            .finish_non_exhaustive()
    }
}

/// Kind of pending authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// A plugin called a gated API
    ApiPermission,
    /// A package with an unknown signature is being installed
    InstallPermission,
}

/// Immutable description of a decision awaiting a human or policy answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub kind: RequestKind,
    pub calling_plugin_id: String,
    pub details: BTreeMap<String, String>,
}

impl AuthorizationRequest {
    pub const KEY_TARGET_PLUGIN_ID: &'static str = "targetPluginId";
    pub const KEY_PERMISSION_LEVEL: &'static str = "permissionLevel";
    pub const KEY_API_METHOD_NAME: &'static str = "apiMethodName";

    pub const KEY_PLUGIN_NAME: &'static str = "pluginName";
    pub const KEY_PLUGIN_VERSION: &'static str = "pluginVersion";
    pub const KEY_PLUGIN_DESCRIPTION: &'static str = "pluginDescription";
    pub const KEY_SIGNATURE_HASH: &'static str = "signatureHash";

    pub fn for_api(
        calling_plugin_id: impl Into<String>,
        target_plugin_id: Option<&str>,
        required_level: PermissionLevel,
        api_method: &str,
    ) -> Self {
        // No target key at all when the call is aimed at the host.
        let mut details = BTreeMap::new();
        if let Some(target) = target_plugin_id {
            details.insert(Self::KEY_TARGET_PLUGIN_ID.to_string(), target.to_string());
        }
        details.insert(
            Self::KEY_PERMISSION_LEVEL.to_string(),
            required_level.as_str().to_string(),
        );
        details.insert(Self::KEY_API_METHOD_NAME.to_string(), api_method.to_string());

        Self {
            kind: RequestKind::ApiPermission,
            calling_plugin_id: calling_plugin_id.into(),
            details,
        }
    }

    pub fn for_install(
        plugin_id: impl Into<String>,
        signature: &str,
        version: &str,
        description: &str,
        name: &str,
    ) -> Self {
        let details = BTreeMap::from([
            (Self::KEY_PLUGIN_NAME.to_string(), name.to_string()),
            (Self::KEY_PLUGIN_VERSION.to_string(), version.to_string()),
            (Self::KEY_PLUGIN_DESCRIPTION.to_string(), description.to_string()),
            (Self::KEY_SIGNATURE_HASH.to_string(), signature.to_string()),
        ]);

        Self {
            kind: RequestKind::InstallPermission,
            calling_plugin_id: plugin_id.into(),
            details,
        }
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }

    /// Target plugin of an API request, `None` when aimed at the host
    pub fn target_plugin_id(&self) -> Option<&str> {
        self.detail(Self::KEY_TARGET_PLUGIN_ID)
    }

    pub fn required_level(&self) -> Option<PermissionLevel> {
        self.detail(Self::KEY_PERMISSION_LEVEL)
            .and_then(PermissionLevel::parse)
    }
}

/// Framework initialization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitState {
    NotInitialized,
    Initializing,
    Initialized,
}

/// Signature policy applied at install time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStrategy {
    /// Only packages signed with the host's certificates install
    #[default]
    Strict,
    /// Unknown signatures are escalated to the authorization handler
    UserGrant,
    /// Signature checks are skipped entirely
    Insecure,
}

impl fmt::Display for ValidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::UserGrant => write!(f, "user_grant"),
            Self::Insecure => write!(f, "insecure"),
        }
    }
}

/// Classification of a plugin-attributed crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    DependencyMissing,
    StaleInstance,
    ResourceNotFound,
    ApiIncompatible,
    Other,
}

impl FaultKind {
    /// Message shown on the recovery surface when no callback handles the crash
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::DependencyMissing => {
                "The plugin is missing a required dependency component and cannot run."
            }
            Self::StaleInstance => {
                "The plugin may not have finished updating, causing an internal component conflict."
            }
            Self::ResourceNotFound => "The plugin tried to access an internal resource that does not exist.",
            Self::ApiIncompatible => "This plugin version is incompatible with the current host version.",
            Self::Other => "The plugin hit an unknown error and cannot continue running.",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DependencyMissing => "dependency_missing",
            Self::StaleInstance => "stale_instance",
            Self::ResourceNotFound => "resource_not_found",
            Self::ApiIncompatible => "api_incompatible",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Crash attributed to a plugin, handed to crash callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCrashInfo {
    pub kind: FaultKind,
    pub culprit: String,
    /// Original panic or error message
    pub message: String,
    pub default_message: String,
}

impl PluginCrashInfo {
    pub fn new(kind: FaultKind, culprit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            culprit: culprit.into(),
            message: message.into(),
            default_message: kind.default_message().to_string(),
        }
    }
}
