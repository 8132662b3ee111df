//! Static permission checks
//!
//! Decisions that can be computed without asking anyone: the NONE, SELF and
//! signature based levels. Anything the static check rejects may still be
//! escalated by the [`crate::authorization::AuthorizationManager`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

use crate::model::PluginInfo;
use crate::registry::PluginRegistry;

/// Permission level required by a gated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// Always allowed
    None,
    /// Caller must be the target plugin
    SelfOnly,
    /// Caller must be signed with certificates trusted by the host
    Signature,
    /// Caller must be signed with the host's own certificates
    Host,
    /// Never passes statically, always escalated to the handler
    UserGrantable,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SelfOnly => "SELF",
            Self::Signature => "SIGNATURE",
            Self::Host => "HOST",
            Self::UserGrantable => "USER_GRANTABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(Self::None),
            "SELF" => Some(Self::SelfOnly),
            "SIGNATURE" => Some(Self::Signature),
            "HOST" => Some(Self::Host),
            "USER_GRANTABLE" => Some(Self::UserGrantable),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of signing certificate digests
pub trait SignatureProvider: Send + Sync {
    /// Digests of the certificates the host itself is signed with
    fn host_signatures(&self) -> HashSet<String>;

    /// Digests of the certificates a plugin module is signed with
    fn plugin_signatures(&self, plugin: &PluginInfo) -> HashSet<String>;
}

/// Fixed digest sets, for hosts that know their certificates up front
#[derive(Debug, Clone, Default)]
pub struct StaticSignatureProvider {
    host: HashSet<String>,
    plugins: HashMap<String, HashSet<String>>,
}

impl StaticSignatureProvider {
    pub fn new<I, S>(host_digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host: host_digests.into_iter().map(Into::into).collect(),
            plugins: HashMap::new(),
        }
    }

    pub fn with_plugin<I, S>(mut self, plugin_id: impl Into<String>, digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins
            .insert(plugin_id.into(), digests.into_iter().map(Into::into).collect());
        self
    }
}

impl SignatureProvider for StaticSignatureProvider {
    fn host_signatures(&self) -> HashSet<String> {
        self.host.clone()
    }

    fn plugin_signatures(&self, plugin: &PluginInfo) -> HashSet<String> {
        self.plugins.get(&plugin.id).cloned().unwrap_or_default()
    }
}

/// Reads the signing certificate stored next to each module.
///
/// A module `greeter.so` is signed by `greeter.so.sig`; its digest is the
/// lowercase SHA-256 hex of the certificate bytes. Host digests are supplied
/// by configuration.
#[derive(Debug, Clone)]
pub struct FileSignatureProvider {
    host: HashSet<String>,
}

impl FileSignatureProvider {
    pub const SIGNATURE_EXTENSION: &'static str = "sig";

    pub fn new<I, S>(host_digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            host: host_digests
                .into_iter()
                .map(|digest| digest.into().to_lowercase())
                .collect(),
        }
    }

    pub fn signature_path(module_path: &Path) -> PathBuf {
        let mut name = module_path.as_os_str().to_owned();
        name.push(".");
        name.push(Self::SIGNATURE_EXTENSION);
        PathBuf::from(name)
    }

    /// Digest of a signature file, `None` if it cannot be read
    pub fn digest_file(path: &Path) -> Option<String> {
        match std::fs::read(path) {
            Ok(bytes) => Some(digest_bytes(&bytes)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no signature file");
                None
            }
        }
    }
}

impl SignatureProvider for FileSignatureProvider {
    fn host_signatures(&self) -> HashSet<String> {
        self.host.clone()
    }

    fn plugin_signatures(&self, plugin: &PluginInfo) -> HashSet<String> {
        Self::digest_file(&Self::signature_path(&plugin.path))
            .into_iter()
            .collect()
    }
}

/// Lowercase SHA-256 hex digest
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Static permission checker
pub struct PermissionChecker {
    registry: Arc<dyn PluginRegistry>,
    signatures: Arc<dyn SignatureProvider>,
    host_digests: OnceLock<HashSet<String>>,
}

impl PermissionChecker {
    pub fn new(registry: Arc<dyn PluginRegistry>, signatures: Arc<dyn SignatureProvider>) -> Self {
        Self {
            registry,
            signatures,
            host_digests: OnceLock::new(),
        }
    }

    /// Host digests, fetched on first use and kept for the checker's lifetime
    pub fn host_digests(&self) -> &HashSet<String> {
        self.host_digests.get_or_init(|| {
            let digests = self.signatures.host_signatures();
            if digests.is_empty() {
                error!("host signature set is empty, signature checks will fail");
            }
            digests
        })
    }

    /// Check whether `caller` may perform an operation requiring `level`.
    ///
    /// NONE always passes. Every other level fails closed when the caller is
    /// unknown or not installed.
    pub fn check_api_permission(
        &self,
        caller: Option<&str>,
        level: PermissionLevel,
        target: Option<&str>,
    ) -> bool {
        debug!(caller = ?caller, level = %level, target = ?target, "checking api permission");

        if level == PermissionLevel::None {
            return true;
        }

        let Some(caller) = caller else {
            warn!(level = %level, "permission denied: calling plugin could not be identified");
            return false;
        };

        let caller_info = match self.registry.get_plugin_by_id(caller) {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(plugin_id = %caller, "permission denied: calling plugin is not installed");
                return false;
            }
            Err(e) => {
                warn!(plugin_id = %caller, error = %e, "permission denied: registry lookup failed");
                return false;
            }
        };

        match level {
            PermissionLevel::None => true,
            PermissionLevel::SelfOnly => match target {
                Some(target) => caller == target,
                None => {
                    warn!(plugin_id = %caller, "SELF permission requires a target plugin id");
                    false
                }
            },
            PermissionLevel::Signature | PermissionLevel::Host => self.has_host_signature(&caller_info),
            PermissionLevel::UserGrantable => false,
        }
    }

    /// Whether a package signed with `signature` may install without asking
    pub fn check_install_permission(&self, signature: &str) -> bool {
        !signature.is_empty() && self.host_digests().contains(&signature.to_lowercase())
    }

    fn has_host_signature(&self, plugin: &PluginInfo) -> bool {
        let plugin_digests = self.signatures.plugin_signatures(plugin);
        if plugin_digests.is_empty() {
            warn!(plugin_id = %plugin.id, "plugin has no signature, permission check failed");
            return false;
        }
        plugin_digests.is_subset(self.host_digests())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryPluginRegistry;

    fn checker_with(plugins: &[&str], signatures: StaticSignatureProvider) -> PermissionChecker {
        let registry = InMemoryPluginRegistry::new();
        for id in plugins {
            registry
                .add_plugin(PluginInfo::new(*id, *id, format!("/plugins/{id}/module"), "entry"))
                .unwrap();
        }
        PermissionChecker::new(Arc::new(registry), Arc::new(signatures))
    }

    #[test]
    fn test_level_names_roundtrip() {
        for level in [
            PermissionLevel::None,
            PermissionLevel::SelfOnly,
            PermissionLevel::Signature,
            PermissionLevel::Host,
            PermissionLevel::UserGrantable,
        ] {
            assert_eq!(PermissionLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(PermissionLevel::parse("ROOT"), None);
    }

    #[test]
    fn test_unknown_caller_fails_closed() {
        let checker = checker_with(&[], StaticSignatureProvider::new(["aa"]));

        assert!(checker.check_api_permission(Some("ghost"), PermissionLevel::None, None));
        assert!(checker.check_api_permission(None, PermissionLevel::None, None));
        assert!(!checker.check_api_permission(Some("ghost"), PermissionLevel::SelfOnly, Some("ghost")));
        assert!(!checker.check_api_permission(Some("ghost"), PermissionLevel::Host, None));
        assert!(!checker.check_api_permission(None, PermissionLevel::Signature, None));
    }

    #[test]
    fn test_self_level() {
        let checker = checker_with(&["p1", "p2"], StaticSignatureProvider::default());

        assert!(checker.check_api_permission(Some("p1"), PermissionLevel::SelfOnly, Some("p1")));
        assert!(!checker.check_api_permission(Some("p1"), PermissionLevel::SelfOnly, Some("p2")));
        assert!(!checker.check_api_permission(Some("p1"), PermissionLevel::SelfOnly, None));
    }

    #[test]
    fn test_host_level_requires_subset() {
        let signatures = StaticSignatureProvider::new(["aa", "bb"])
            .with_plugin("trusted", ["aa"])
            .with_plugin("foreign", ["aa", "cc"]);
        let checker = checker_with(&["trusted", "foreign", "unsigned"], signatures);

        assert!(checker.check_api_permission(Some("trusted"), PermissionLevel::Host, None));
        assert!(!checker.check_api_permission(Some("foreign"), PermissionLevel::Signature, None));
        assert!(!checker.check_api_permission(Some("unsigned"), PermissionLevel::Host, None));
        assert!(!checker.check_api_permission(Some("trusted"), PermissionLevel::UserGrantable, None));
    }

    #[test]
    fn test_install_permission() {
        let checker = checker_with(&[], StaticSignatureProvider::new(["abcd"]));
        assert!(checker.check_install_permission("ABCD"));
        assert!(!checker.check_install_permission("ef01"));
        assert!(!checker.check_install_permission(""));
    }

    #[test]
    fn test_file_signature_digest() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("greeter.so");
        std::fs::write(&module, b"module").unwrap();
        std::fs::write(FileSignatureProvider::signature_path(&module), b"certificate").unwrap();

        let expected = digest_bytes(b"certificate");
        let provider = FileSignatureProvider::new([expected.to_uppercase()]);
        let info = PluginInfo::new("greeter", "Greeter", &module, "entry");

        assert_eq!(provider.plugin_signatures(&info), HashSet::from([expected.clone()]));
        assert!(provider.host_signatures().contains(&expected));
    }
}
