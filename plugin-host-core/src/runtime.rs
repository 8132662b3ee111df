//! Public runtime surface
//!
//! [`PluginRuntime`] is the one object an embedding host constructs. Every
//! operation takes an explicit [`Caller`] and is checked against the
//! runtime's [`PolicyTable`](crate::policy::PolicyTable) before its body
//! runs. Denials return `false`, `None` or an empty list and have no side
//! effects.

use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::authorization::AuthorizationHandler;
use crate::context::FrameworkContext;
use crate::crash::{CrashCallback, CrashFallback, FixedRecovery, PluginCrashHandler, ProcessRecovery, RecoveryChoice};
use crate::error::{PluginResult, PluginRuntimeError};
use crate::installer::{InstallResult, PluginInstaller, PluginPackage};
use crate::lifecycle::{LifecycleManager, PluginState};
use crate::loader::{InterfaceInstance, PluginEntry};
use crate::model::{InitState, PluginInfo, ValidationStrategy};
use crate::policy::{ApiOperation, Caller};

/// Plugin runtime facade
pub struct PluginRuntime {
    context: Arc<FrameworkContext>,
    lifecycle: LifecycleManager,
    installer: PluginInstaller,
}

impl PluginRuntime {
    pub fn new(context: Arc<FrameworkContext>) -> Self {
        Self {
            lifecycle: LifecycleManager::new(context.clone()),
            installer: PluginInstaller::new(context.clone()),
            context,
        }
    }

    pub fn context(&self) -> &Arc<FrameworkContext> {
        &self.context
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn allowed(&self, caller: &Caller, operation: ApiOperation, target: Option<&str>) -> bool {
        self.context.gate().authorize(caller, operation, target).await
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Run host setup once and, if configured, load every enabled plugin.
    ///
    /// Concurrent callers wait for the first one. A failed setup returns the
    /// runtime to `NotInitialized` so it can be retried.
    pub async fn initialize<F>(&self, setup: F) -> PluginResult<()>
    where
        F: Future<Output = PluginResult<()>>,
    {
        if !self.context.begin_init() {
            return match self.await_initialization().await {
                InitState::Initialized => Ok(()),
                _ => Err(PluginRuntimeError::InitializationFailed(
                    "concurrent initialization failed".to_string(),
                )),
            };
        }

        info!(host = %self.context.config().host_name, "initializing plugin runtime");
        if let Err(e) = setup.await {
            error!(error = %e, "plugin runtime initialization failed");
            self.context.set_init_state(InitState::NotInitialized);
            return Err(PluginRuntimeError::InitializationFailed(e.to_string()));
        }

        if self.context.config().install_crash_handler {
            self.install_crash_handler(self.default_crash_fallback());
        }

        self.context.set_init_state(InitState::Initialized);
        info!("plugin runtime initialized");

        if self.context.config().load_enabled_on_start {
            let loaded = self.lifecycle.load_enabled_plugins().await;
            info!(loaded, "enabled plugins loaded at startup");
        }
        Ok(())
    }

    /// Wait until initialization settles; returns the settled state
    pub async fn await_initialization(&self) -> InitState {
        let mut receiver = self.context.subscribe_init_state();
        loop {
            let state = *receiver.borrow_and_update();
            if state != InitState::Initializing {
                return state;
            }
            if receiver.changed().await.is_err() {
                return self.context.init_state();
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.context.init_state() == InitState::Initialized
    }

    fn default_crash_fallback(&self) -> Arc<dyn CrashFallback> {
        let choice = if self.context.config().restart_on_crash {
            RecoveryChoice::DisableAndRestart
        } else {
            RecoveryChoice::Terminate
        };
        Arc::new(ProcessRecovery::new(
            self.context.registry().clone(),
            Arc::new(FixedRecovery(choice)),
        ))
    }

    /// Install the panic hook that attributes crashes to plugins
    pub fn install_crash_handler(&self, fallback: Arc<dyn CrashFallback>) -> Arc<PluginCrashHandler> {
        let handler = Arc::new(PluginCrashHandler::new(self.context.clone(), fallback));
        handler.clone().install();
        handler
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch a plugin, or reload it together with its dependents
    pub async fn launch_plugin(&self, caller: &Caller, plugin_id: &str) -> bool {
        if !self.allowed(caller, ApiOperation::LaunchPlugin, Some(plugin_id)).await {
            return false;
        }
        self.lifecycle.launch(plugin_id).await
    }

    pub async fn unload_plugin(&self, caller: &Caller, plugin_id: &str) -> bool {
        if !self.allowed(caller, ApiOperation::UnloadPlugin, Some(plugin_id)).await {
            return false;
        }
        self.lifecycle.unload(plugin_id).await
    }

    pub async fn load_enabled_plugins(&self, caller: &Caller) -> usize {
        if !self.allowed(caller, ApiOperation::LoadEnabledPlugins, None).await {
            return 0;
        }
        self.lifecycle.load_enabled_plugins().await
    }

    /// Persist the enabled flag; takes effect on the next batch load
    pub async fn set_plugin_enabled(&self, caller: &Caller, plugin_id: &str, enabled: bool) -> bool {
        if !self.allowed(caller, ApiOperation::SetPluginEnabled, Some(plugin_id)).await {
            return false;
        }

        let registry = self.context.registry();
        let result = registry.get_plugin_by_id(plugin_id).and_then(|info| {
            let info = info.ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))?;
            registry.update_plugin(info.with_enabled(enabled))?;
            registry.flush_to_disk()
        });

        match result {
            Ok(()) => {
                info!(plugin_id, enabled, "plugin enabled flag updated");
                true
            }
            Err(e) => {
                warn!(plugin_id, error = %e, "failed to update enabled flag");
                false
            }
        }
    }

    pub fn plugin_state(&self, plugin_id: &str) -> PluginState {
        self.lifecycle.state(plugin_id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Resolve an interface implementation by fully-qualified symbol.
    ///
    /// Symbols owned by a plugin come from its loader; anything else is
    /// looked up in the host's interface table.
    pub async fn get_interface(&self, caller: &Caller, capability: &str, symbol: &str) -> Option<InterfaceInstance> {
        if !self.allowed(caller, ApiOperation::GetInterface, None).await {
            return None;
        }

        match self.context.index().lookup(symbol) {
            Some(owner) => match self.context.loaded_plugin(&owner) {
                Some(loaded) => loaded.loader.get_interface(capability, symbol),
                None => {
                    warn!(symbol, plugin_id = %owner, "indexed symbol belongs to a plugin that is not loaded");
                    None
                }
            },
            None => self.context.host().get_interface(symbol),
        }
    }

    pub async fn get_plugin_info(&self, caller: &Caller, plugin_id: &str) -> Option<PluginInfo> {
        if !self.allowed(caller, ApiOperation::GetPluginInfo, Some(plugin_id)).await {
            return None;
        }
        match self.context.plugin_info(plugin_id) {
            Ok(info) => info,
            Err(e) => {
                warn!(plugin_id, error = %e, "plugin info lookup failed");
                None
            }
        }
    }

    pub async fn get_plugin_instance(&self, caller: &Caller, plugin_id: &str) -> Option<Arc<dyn PluginEntry>> {
        if !self.allowed(caller, ApiOperation::GetPluginInstance, Some(plugin_id)).await {
            return None;
        }
        self.context.instance(plugin_id)
    }

    /// Records of the loaded plugins, sorted by id
    pub async fn loaded_plugins(&self, caller: &Caller) -> Vec<PluginInfo> {
        if !self.allowed(caller, ApiOperation::GetLoadedPlugins, None).await {
            return Vec::new();
        }
        let mut plugins: Vec<PluginInfo> = self
            .context
            .loaded()
            .load()
            .values()
            .map(|loaded| loaded.info.clone())
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub async fn all_installed_plugins(&self, caller: &Caller) -> Vec<PluginInfo> {
        if !self.allowed(caller, ApiOperation::GetInstalledPlugins, None).await {
            return Vec::new();
        }
        self.context.registry().get_all_plugins().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read installed plugins");
            Vec::new()
        })
    }

    pub fn is_plugin_loaded(&self, plugin_id: &str) -> bool {
        self.context.is_loaded(plugin_id)
    }

    /// Plugins that depend on `plugin_id`, transitively
    pub async fn get_plugin_dependents_chain(&self, caller: &Caller, plugin_id: &str) -> Vec<String> {
        if !self.allowed(caller, ApiOperation::GetDependentsChain, Some(plugin_id)).await {
            return Vec::new();
        }
        self.context.dependencies().find_dependents_recursive(plugin_id)
    }

    /// Plugins `plugin_id` depends on, transitively
    pub async fn get_plugin_dependencies_chain(&self, caller: &Caller, plugin_id: &str) -> Vec<String> {
        if !self.allowed(caller, ApiOperation::GetDependenciesChain, Some(plugin_id)).await {
            return Vec::new();
        }
        self.context.dependencies().find_dependencies_recursive(plugin_id)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn set_validation_strategy(&self, caller: &Caller, strategy: ValidationStrategy) -> bool {
        if !self.allowed(caller, ApiOperation::SetValidationStrategy, None).await {
            return false;
        }
        self.context.set_validation_strategy(strategy);
        info!(%strategy, "validation strategy changed");
        true
    }

    pub fn validation_strategy(&self) -> ValidationStrategy {
        self.context.validation_strategy()
    }

    /// Replace the authorization handler; `None` restores the default
    pub async fn set_authorization_handler(
        &self,
        caller: &Caller,
        handler: Option<Arc<dyn AuthorizationHandler>>,
    ) -> bool {
        if !self.allowed(caller, ApiOperation::SetAuthorizationHandler, None).await {
            return false;
        }
        self.context.authorization().set_handler(handler);
        true
    }

    pub async fn set_global_crash_callback(&self, caller: &Caller, callback: Option<Arc<dyn CrashCallback>>) -> bool {
        if !self.allowed(caller, ApiOperation::SetGlobalCrashCallback, None).await {
            return false;
        }
        self.context.crash_callbacks().set_global_callback(callback);
        true
    }

    pub async fn set_plugin_crash_callback(
        &self,
        caller: &Caller,
        plugin_id: &str,
        callback: Option<Arc<dyn CrashCallback>>,
    ) -> bool {
        if !self.allowed(caller, ApiOperation::SetPluginCrashCallback, Some(plugin_id)).await {
            return false;
        }
        self.context.crash_callbacks().set_plugin_callback(plugin_id, callback);
        true
    }

    // ------------------------------------------------------------------
    // Installation
    // ------------------------------------------------------------------

    pub async fn install_plugin(&self, caller: &Caller, package: PluginPackage, force_overwrite: bool) -> InstallResult {
        let plugin_id = package.manifest.id.clone();
        if !self.allowed(caller, ApiOperation::InstallPlugin, Some(&plugin_id)).await {
            return InstallResult::failed(PluginRuntimeError::PermissionDenied(format!(
                "{} may not install {}",
                caller, plugin_id
            )));
        }
        self.installer.install_plugin(package, force_overwrite).await
    }

    /// Unload the plugin if needed, then remove its files and record
    pub async fn uninstall_plugin(&self, caller: &Caller, plugin_id: &str) -> bool {
        if !self.allowed(caller, ApiOperation::UninstallPlugin, Some(plugin_id)).await {
            return false;
        }

        if self.context.is_loaded(plugin_id) && !self.lifecycle.unload(plugin_id).await {
            warn!(plugin_id, "uninstall aborted: plugin could not be unloaded");
            return false;
        }
        self.context.crash_callbacks().set_plugin_callback(plugin_id, None);
        self.installer.uninstall_plugin(plugin_id)
    }
}
