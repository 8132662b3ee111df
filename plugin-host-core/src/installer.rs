//! Plugin installer
//!
//! Puts a plugin package on disk and records it in the registry. An install
//! either commits completely (files copied, symbol index written, registry
//! flushed) or restores the previous installation from its backup.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::FrameworkContext;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::index::{write_symbol_index, SYMBOL_INDEX_FILENAME};
use crate::model::{AuthorizationRequest, ComponentDescriptor, PluginInfo, PluginVersion, ValidationStrategy};
use crate::permission::FileSignatureProvider;

/// Plugin metadata shipped with a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: PluginVersion,
    pub entry_point: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub static_receivers: Vec<ComponentDescriptor>,
    #[serde(default)]
    pub providers: Vec<ComponentDescriptor>,
}

impl PluginManifest {
    pub fn validate(&self) -> PluginResult<()> {
        if self.id.trim().is_empty() {
            return Err(PluginRuntimeError::InvalidManifest("plugin id must not be blank".to_string()));
        }
        if self.entry_point.trim().is_empty() {
            return Err(PluginRuntimeError::InvalidManifest(format!(
                "plugin {} declares no entry point",
                self.id
            )));
        }
        if self.id.contains(['/', '\\']) || self.id.starts_with('.') {
            return Err(PluginRuntimeError::InvalidManifest(format!(
                "plugin id '{}' is not a valid directory name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Manifest file format read by [`PluginPackage::from_manifest_file`]
#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(flatten)]
    manifest: PluginManifest,
    /// Module file, relative to the manifest
    module: PathBuf,
    #[serde(default)]
    symbols: Vec<String>,
}

/// Installable plugin package
#[derive(Debug, Clone)]
pub struct PluginPackage {
    pub manifest: PluginManifest,
    pub module_file: PathBuf,
    /// Signing certificate, defaults to `<module>.sig` when present
    pub signature_file: Option<PathBuf>,
    /// Symbols to record in the install directory's symbol index
    pub symbols: Vec<String>,
}

impl PluginPackage {
    pub fn new(manifest: PluginManifest, module_file: impl Into<PathBuf>) -> Self {
        let module_file = module_file.into();
        let signature = FileSignatureProvider::signature_path(&module_file);
        Self {
            manifest,
            signature_file: signature.is_file().then_some(signature),
            module_file,
            symbols: Vec::new(),
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn with_signature_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.signature_file = Some(path.into());
        self
    }

    /// Read a JSON package manifest
    pub fn from_manifest_file(path: &Path) -> PluginResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let document: PackageDocument = serde_json::from_str(&raw)
            .map_err(|e| PluginRuntimeError::InvalidManifest(format!("{}: {}", path.display(), e)))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let module_file = base.join(&document.module);
        Ok(Self::new(document.manifest, module_file).with_symbols(document.symbols))
    }

    /// SHA-256 digest of the signing certificate
    pub fn signature_digest(&self) -> Option<String> {
        self.signature_file
            .as_deref()
            .and_then(FileSignatureProvider::digest_file)
    }
}

/// Outcome of an install
#[derive(Debug, Clone, PartialEq)]
pub enum InstallResult {
    Success(PluginInfo),
    Failure { reason: String },
}

impl InstallResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure { reason: reason.into() }
    }

    pub fn failed(error: PluginRuntimeError) -> Self {
        Self::failure(error.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// On-disk installer
pub struct PluginInstaller {
    context: Arc<FrameworkContext>,
}

impl PluginInstaller {
    pub fn new(context: Arc<FrameworkContext>) -> Self {
        Self { context }
    }

    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.context.config().plugin_dir(plugin_id)
    }

    /// Install or upgrade a package.
    ///
    /// Upgrades must increase the version code unless `force_overwrite` is
    /// set. The enabled flag and install time of an existing installation
    /// are kept.
    pub async fn install_plugin(&self, package: PluginPackage, force_overwrite: bool) -> InstallResult {
        let manifest = &package.manifest;
        info!(plugin_id = %manifest.id, force_overwrite, "installing plugin");

        if let Err(e) = manifest.validate() {
            warn!(error = %e, "manifest rejected");
            return InstallResult::failure(e.to_string());
        }
        if !package.module_file.is_file() {
            return InstallResult::failed(PluginRuntimeError::InstallationFailed(format!(
                "module file {} does not exist",
                package.module_file.display()
            )));
        }

        if let Err(e) = self.check_signature(&package).await {
            warn!(plugin_id = %manifest.id, error = %e, "signature check failed");
            return InstallResult::failed(e);
        }

        let existing = match self.context.registry().get_plugin_by_id(&manifest.id) {
            Ok(existing) => existing,
            Err(e) => return InstallResult::failure(e.to_string()),
        };

        match &existing {
            None => info!(plugin_id = %manifest.id, "new plugin"),
            Some(_) if force_overwrite => info!(plugin_id = %manifest.id, "forced overwrite"),
            Some(current) if manifest.version.code <= current.version.code => {
                return InstallResult::failed(PluginRuntimeError::InstallationFailed(format!(
                    "installed version code {} is not lower than {}",
                    current.version.code, manifest.version.code
                )));
            }
            Some(current) => info!(
                plugin_id = %manifest.id,
                from = %current.version,
                to = %manifest.version,
                "upgrading plugin"
            ),
        }

        let context = self.context.clone();
        let plugin_id = manifest.id.clone();
        let result = tokio::task::spawn_blocking(move || install_files(&context, &package, existing)).await;

        match result {
            Ok(Ok(info)) => {
                info!(plugin_id = %info.id, version = %info.version, "plugin installed");
                InstallResult::Success(info)
            }
            Ok(Err(e)) => {
                error!(plugin_id = %plugin_id, error = %e, "plugin installation failed");
                InstallResult::failed(PluginRuntimeError::InstallationFailed(e.to_string()))
            }
            Err(e) => {
                error!(plugin_id = %plugin_id, error = %e, "installation task failed");
                InstallResult::failed(PluginRuntimeError::InstallationFailed(format!(
                    "installation task failed: {}",
                    e
                )))
            }
        }
    }

    async fn check_signature(&self, package: &PluginPackage) -> PluginResult<()> {
        let strategy = self.context.validation_strategy();
        if strategy == ValidationStrategy::Insecure {
            warn!(plugin_id = %package.manifest.id, "signature validation skipped");
            return Ok(());
        }

        let Some(digest) = package.signature_digest() else {
            return Err(PluginRuntimeError::InstallationFailed("package is not signed".to_string()));
        };

        if self.context.permissions().check_install_permission(&digest) {
            return Ok(());
        }

        match strategy {
            ValidationStrategy::Strict => Err(PluginRuntimeError::InstallationFailed(
                "package signature is not trusted by the host".to_string(),
            )),
            ValidationStrategy::UserGrant => {
                let manifest = &package.manifest;
                let request = AuthorizationRequest::for_install(
                    manifest.id.as_str(),
                    &digest,
                    &manifest.version.name,
                    &manifest.description,
                    &manifest.name,
                );
                if self
                    .context
                    .authorization()
                    .request_authorization(&request, false)
                    .await
                {
                    Ok(())
                } else {
                    Err(PluginRuntimeError::PermissionDenied(format!(
                        "installation of untrusted package {} was not authorized",
                        manifest.id
                    )))
                }
            }
            ValidationStrategy::Insecure => Ok(()),
        }
    }

    /// Remove a plugin's files and registry record.
    ///
    /// The directory is renamed aside before deletion and renamed back if the
    /// deletion fails.
    pub fn uninstall_plugin(&self, plugin_id: &str) -> bool {
        info!(plugin_id, "uninstalling plugin");
        let plugin_dir = self.plugin_dir(plugin_id);

        if !plugin_dir.exists() {
            warn!(plugin_id, dir = %plugin_dir.display(), "plugin directory missing, cleaning registry only");
            return match self.remove_record(plugin_id) {
                Ok(()) => true,
                Err(e) => {
                    error!(plugin_id, error = %e, "failed to remove registry record");
                    false
                }
            };
        }

        let deleting = plugin_dir.with_file_name(format!(
            "{}.deleting_{}",
            plugin_id,
            Utc::now().timestamp_millis()
        ));
        if let Err(e) = std::fs::rename(&plugin_dir, &deleting) {
            error!(plugin_id, error = %e, "cannot move plugin directory aside");
            return false;
        }

        if let Err(e) = std::fs::remove_dir_all(&deleting) {
            error!(plugin_id, error = %e, "failed to delete plugin directory");
            if let Err(e) = std::fs::rename(&deleting, &plugin_dir) {
                error!(plugin_id, dir = %deleting.display(), error = %e, "rollback failed, plugin left inconsistent");
            }
            return false;
        }

        match self.remove_record(plugin_id) {
            Ok(()) => {
                info!(plugin_id, "plugin uninstalled");
                true
            }
            Err(e) => {
                error!(plugin_id, error = %e, "failed to remove registry record");
                false
            }
        }
    }

    fn remove_record(&self, plugin_id: &str) -> PluginResult<()> {
        let registry = self.context.registry();
        if registry.remove_plugin(plugin_id)? {
            registry.flush_to_disk()?;
        }
        Ok(())
    }
}

fn install_files(
    context: &FrameworkContext,
    package: &PluginPackage,
    existing: Option<PluginInfo>,
) -> PluginResult<PluginInfo> {
    let manifest = &package.manifest;
    let plugins_dir = &context.config().plugins_dir;
    let plugin_dir = context.config().plugin_dir(&manifest.id);
    let backup_dir = plugins_dir.join(format!("{}.backup", manifest.id));

    std::fs::create_dir_all(plugins_dir)?;

    let mut has_backup = false;
    if plugin_dir.exists() {
        if backup_dir.exists() {
            std::fs::remove_dir_all(&backup_dir)?;
        }
        match std::fs::rename(&plugin_dir, &backup_dir) {
            Ok(()) => {
                has_backup = true;
                debug!(plugin_id = %manifest.id, backup = %backup_dir.display(), "previous installation backed up");
            }
            Err(e) => warn!(plugin_id = %manifest.id, error = %e, "backup failed, continuing"),
        }
    }

    match write_installation(context, package, &plugin_dir, existing) {
        Ok(info) => {
            if has_backup {
                if let Err(e) = std::fs::remove_dir_all(&backup_dir) {
                    warn!(plugin_id = %manifest.id, error = %e, "failed to remove backup");
                }
            }
            Ok(info)
        }
        Err(e) => {
            if plugin_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&plugin_dir) {
                    warn!(plugin_id = %manifest.id, error = %e, "failed to clean partial installation");
                }
            }
            if has_backup {
                match std::fs::rename(&backup_dir, &plugin_dir) {
                    Ok(()) => info!(plugin_id = %manifest.id, "restored previous installation"),
                    Err(e) => error!(plugin_id = %manifest.id, error = %e, "restore from backup failed"),
                }
            }
            Err(e)
        }
    }
}

fn write_installation(
    context: &FrameworkContext,
    package: &PluginPackage,
    plugin_dir: &Path,
    existing: Option<PluginInfo>,
) -> PluginResult<PluginInfo> {
    let manifest = &package.manifest;
    std::fs::create_dir_all(plugin_dir)?;

    let file_name = package
        .module_file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("module"));
    let module_target = plugin_dir.join(file_name);
    std::fs::copy(&package.module_file, &module_target)?;

    if let Some(signature) = &package.signature_file {
        std::fs::copy(signature, FileSignatureProvider::signature_path(&module_target))?;
    }

    write_symbol_index(&plugin_dir.join(SYMBOL_INDEX_FILENAME), &package.symbols)?;

    let info = PluginInfo {
        id: manifest.id.clone(),
        name: manifest.name.clone(),
        description: manifest.description.clone(),
        version: manifest.version.clone(),
        path: module_target,
        entry_point: manifest.entry_point.clone(),
        enabled: existing.as_ref().map_or(true, |e| e.enabled),
        install_time: existing.as_ref().map_or_else(Utc::now, |e| e.install_time),
        dependencies: manifest.dependencies.clone(),
        static_receivers: manifest.static_receivers.clone(),
        providers: manifest.providers.clone(),
    };

    let registry = context.registry();
    if existing.is_some() {
        registry.update_plugin(info.clone())?;
    } else {
        registry.add_plugin(info.clone())?;
    }
    registry.flush_to_disk()?;

    Ok(info)
}
