//! Framework context
//!
//! The single owner of shared runtime state: loaded-plugin and instance
//! tables, the module index, init state, validation strategy and every
//! pluggable collaborator. Built once through [`FrameworkContextBuilder`] and
//! handed to each component as an `Arc`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::info;

use crate::authorization::{AuthorizationHandler, AuthorizationManager, AutoDenyHandler};
use crate::config::RuntimeConfig;
use crate::crash::CrashCallbacks;
use crate::dependency::{DependencyManager, PluginStateProvider};
use crate::error::PluginResult;
use crate::index::ModuleIndex;
use crate::loader::{HostApplication, ModuleLoader, ModuleLoaderFactory, PluginEntry};
use crate::model::{InitState, LoadedPlugin, PluginInfo, ValidationStrategy};
use crate::native::NativeModuleLoaderFactory;
use crate::permission::{FileSignatureProvider, PermissionChecker, SignatureProvider};
use crate::policy::{PermissionGate, PolicyTable};
use crate::proxy::{ComponentProxy, ComponentProxyTable};
use crate::registry::{JsonFilePluginRegistry, PluginRegistry};
use crate::resources::{ResourceOverlay, ResourceTable};

/// Copy-on-write table.
///
/// Readers clone the current `Arc` and never observe a half-applied update;
/// writers build the next value from a copy and publish it in one swap.
/// Writers are expected to be serialized by the caller.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T: Clone> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Compute the next value and publish it
    pub fn update<R>(&self, apply: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.current.write();
        let mut next = T::clone(&guard);
        let result = apply(&mut next);
        *guard = Arc::new(next);
        result
    }
}

impl<T: Clone + Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub type LoadedTable = HashMap<String, Arc<LoadedPlugin>>;
pub type InstanceTable = HashMap<String, Arc<dyn PluginEntry>>;

/// Shared runtime state
pub struct FrameworkContext {
    config: RuntimeConfig,
    host: Arc<HostApplication>,
    registry: Arc<dyn PluginRegistry>,
    loader_factory: Arc<dyn ModuleLoaderFactory>,
    proxies: Arc<dyn ComponentProxy>,
    resources: Arc<dyn ResourceOverlay>,
    permissions: Arc<PermissionChecker>,
    gate: PermissionGate,
    crash_callbacks: CrashCallbacks,
    index: ModuleIndex,
    dependencies: Arc<DependencyManager>,
    loaded: Snapshot<LoadedTable>,
    instances: Snapshot<InstanceTable>,
    init_state: watch::Sender<InitState>,
    validation_strategy: RwLock<ValidationStrategy>,
}

impl FrameworkContext {
    pub fn builder(config: RuntimeConfig) -> FrameworkContextBuilder {
        FrameworkContextBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<HostApplication> {
        &self.host
    }

    pub fn registry(&self) -> &Arc<dyn PluginRegistry> {
        &self.registry
    }

    pub fn loader_factory(&self) -> &Arc<dyn ModuleLoaderFactory> {
        &self.loader_factory
    }

    pub fn proxies(&self) -> &Arc<dyn ComponentProxy> {
        &self.proxies
    }

    pub fn resources(&self) -> &Arc<dyn ResourceOverlay> {
        &self.resources
    }

    pub fn permissions(&self) -> &Arc<PermissionChecker> {
        &self.permissions
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn authorization(&self) -> &Arc<AuthorizationManager> {
        self.gate.authorization()
    }

    pub fn crash_callbacks(&self) -> &CrashCallbacks {
        &self.crash_callbacks
    }

    pub fn index(&self) -> &ModuleIndex {
        &self.index
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    pub fn loaded(&self) -> &Snapshot<LoadedTable> {
        &self.loaded
    }

    pub fn instances(&self) -> &Snapshot<InstanceTable> {
        &self.instances
    }

    pub fn loaded_plugin(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        self.loaded.load().get(plugin_id).cloned()
    }

    pub fn instance(&self, plugin_id: &str) -> Option<Arc<dyn PluginEntry>> {
        self.instances.load().get(plugin_id).cloned()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.load().contains_key(plugin_id)
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.borrow()
    }

    pub fn subscribe_init_state(&self) -> watch::Receiver<InitState> {
        self.init_state.subscribe()
    }

    pub(crate) fn set_init_state(&self, state: InitState) {
        self.init_state.send_replace(state);
    }

    /// Move `NotInitialized` to `Initializing`; false if another caller got there first
    pub(crate) fn begin_init(&self) -> bool {
        self.init_state.send_if_modified(|state| {
            if *state == InitState::NotInitialized {
                *state = InitState::Initializing;
                true
            } else {
                false
            }
        })
    }

    pub fn validation_strategy(&self) -> ValidationStrategy {
        *self.validation_strategy.read()
    }

    pub(crate) fn set_validation_strategy(&self, strategy: ValidationStrategy) {
        *self.validation_strategy.write() = strategy;
    }

    /// Installed record of a plugin, preferring the loaded copy
    pub fn plugin_info(&self, plugin_id: &str) -> PluginResult<Option<PluginInfo>> {
        if let Some(loaded) = self.loaded_plugin(plugin_id) {
            return Ok(Some(loaded.info.clone()));
        }
        self.registry.get_plugin_by_id(plugin_id)
    }
}

impl PluginStateProvider for FrameworkContext {
    fn loaded_plugin_ids(&self) -> Vec<String> {
        self.loaded.load().keys().cloned().collect()
    }

    fn declared_dependencies(&self, plugin_id: &str) -> Vec<String> {
        match self.plugin_info(plugin_id) {
            Ok(Some(info)) => info.dependencies,
            _ => Vec::new(),
        }
    }

    fn symbol_owner(&self, symbol: &str) -> Option<String> {
        self.index.lookup(symbol)
    }

    fn loader_of(&self, plugin_id: &str) -> Option<Arc<dyn ModuleLoader>> {
        self.loaded_plugin(plugin_id).map(|loaded| loaded.loader.clone())
    }
}

/// Builder for [`FrameworkContext`]; unset collaborators get defaults
pub struct FrameworkContextBuilder {
    config: RuntimeConfig,
    host: Option<Arc<HostApplication>>,
    registry: Option<Arc<dyn PluginRegistry>>,
    loader_factory: Option<Arc<dyn ModuleLoaderFactory>>,
    proxies: Option<Arc<dyn ComponentProxy>>,
    resources: Option<Arc<dyn ResourceOverlay>>,
    signatures: Option<Arc<dyn SignatureProvider>>,
    authorization_handler: Option<Arc<dyn AuthorizationHandler>>,
    policies: PolicyTable,
}

impl FrameworkContextBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            host: None,
            registry: None,
            loader_factory: None,
            proxies: None,
            resources: None,
            signatures: None,
            authorization_handler: None,
            policies: PolicyTable::default(),
        }
    }

    pub fn host(mut self, host: Arc<HostApplication>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn PluginRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn loader_factory(mut self, factory: Arc<dyn ModuleLoaderFactory>) -> Self {
        self.loader_factory = Some(factory);
        self
    }

    pub fn proxies(mut self, proxies: Arc<dyn ComponentProxy>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceOverlay>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn signatures(mut self, signatures: Arc<dyn SignatureProvider>) -> Self {
        self.signatures = Some(signatures);
        self
    }

    /// Handler used when no other has been set; defaults to denying
    pub fn authorization_handler(mut self, handler: Arc<dyn AuthorizationHandler>) -> Self {
        self.authorization_handler = Some(handler);
        self
    }

    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn build(self) -> PluginResult<Arc<FrameworkContext>> {
        let config = self.config;

        let registry: Arc<dyn PluginRegistry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(JsonFilePluginRegistry::open(&config.registry_file)?),
        };
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(HostApplication::new(&config.host_name, &config.data_dir)));
        let loader_factory = self
            .loader_factory
            .unwrap_or_else(|| Arc::new(NativeModuleLoaderFactory::new()));
        let proxies = self
            .proxies
            .unwrap_or_else(|| Arc::new(ComponentProxyTable::new()));
        let resources = self
            .resources
            .unwrap_or_else(|| Arc::new(ResourceTable::new()));
        let signatures = self
            .signatures
            .unwrap_or_else(|| Arc::new(FileSignatureProvider::new(config.host_signatures.clone())));
        let handler = self
            .authorization_handler
            .unwrap_or_else(|| Arc::new(AutoDenyHandler));

        let permissions = Arc::new(PermissionChecker::new(registry.clone(), signatures));
        let gate = PermissionGate::new(
            self.policies,
            Arc::new(AuthorizationManager::new(permissions.clone(), handler)),
        );
        let (init_state, _) = watch::channel(InitState::NotInitialized);
        let validation_strategy = RwLock::new(config.validation_strategy);

        let context = Arc::new_cyclic(|weak: &Weak<FrameworkContext>| {
            let state: Weak<dyn PluginStateProvider> = weak.clone();
            FrameworkContext {
                config,
                host,
                registry,
                loader_factory,
                proxies,
                resources,
                permissions,
                gate,
                crash_callbacks: CrashCallbacks::default(),
                index: ModuleIndex::new(),
                dependencies: Arc::new(DependencyManager::new(state)),
                loaded: Snapshot::default(),
                instances: Snapshot::default(),
                init_state,
                validation_strategy,
            }
        });

        info!(host = %context.host.name(), "framework context created");
        Ok(context)
    }
}
