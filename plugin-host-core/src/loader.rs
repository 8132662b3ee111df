//! Module loader boundary
//!
//! A module loader turns an on-disk (or statically linked) plugin module into
//! something the lifecycle manager can ask for entry points and interface
//! instances by fully-qualified symbol name. How the code gets into the
//! process is up to the [`ModuleLoaderFactory`]; the lifecycle manager only
//! sees the traits defined here.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PluginResult, PluginRuntimeError};
use crate::model::PluginInfo;

/// Type-erased interface instance; callers downcast to the concrete type
pub type InterfaceInstance = Arc<dyn Any + Send + Sync>;

/// Host application handle shared with every plugin
pub struct HostApplication {
    name: String,
    data_dir: PathBuf,
    interfaces: DashMap<String, InterfaceInstance>,
}

impl HostApplication {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            interfaces: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Expose a host-provided implementation under `symbol`
    pub fn register_interface(&self, symbol: impl Into<String>, instance: InterfaceInstance) {
        self.interfaces.insert(symbol.into(), instance);
    }

    pub fn get_interface(&self, symbol: &str) -> Option<InterfaceInstance> {
        self.interfaces.get(symbol).map(|entry| entry.value().clone())
    }
}

impl fmt::Debug for HostApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApplication")
            .field("name", &self.name)
            .field("data_dir", &self.data_dir)
            .field("interfaces", &self.interfaces.len())
            .finish()
    }
}

/// Cross-plugin symbol resolution handed to every loader
pub trait PluginFinder: Send + Sync {
    /// Resolve `symbol` in another loaded plugin on behalf of `requester`
    fn find_interface(
        &self,
        requester: &str,
        capability: &str,
        symbol: &str,
    ) -> Option<InterfaceInstance>;
}

/// What a plugin module can see of the outside world
#[derive(Clone)]
pub struct ModuleScope {
    plugin_id: String,
    host: Arc<HostApplication>,
    finder: Arc<dyn PluginFinder>,
}

impl ModuleScope {
    pub fn new(
        plugin_id: impl Into<String>,
        host: Arc<HostApplication>,
        finder: Arc<dyn PluginFinder>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            host,
            finder,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn host(&self) -> &Arc<HostApplication> {
        &self.host
    }

    /// Look a symbol up in other plugins first, then in the host
    pub fn find_interface(&self, capability: &str, symbol: &str) -> Option<InterfaceInstance> {
        self.finder
            .find_interface(&self.plugin_id, capability, symbol)
            .or_else(|| self.host.get_interface(symbol))
    }
}

/// Context passed to a plugin entry when it is loaded
#[derive(Clone)]
pub struct PluginContext {
    pub host: Arc<HostApplication>,
    pub plugin_info: PluginInfo,
    scope: ModuleScope,
}

impl PluginContext {
    pub fn new(plugin_info: PluginInfo, scope: ModuleScope) -> Self {
        Self {
            host: scope.host.clone(),
            plugin_info,
            scope,
        }
    }

    pub fn find_interface(&self, capability: &str, symbol: &str) -> Option<InterfaceInstance> {
        self.scope.find_interface(capability, symbol)
    }
}

/// Entry object every plugin exposes.
///
/// Hooks run while the lifecycle manager holds its driver guard. Launch and
/// unload calls made from inside a hook are refused and return a failure;
/// work that must change the lifecycle has to be started after the hook
/// returns, and must not be awaited by the hook itself.
#[async_trait]
pub trait PluginEntry: Send + Sync {
    /// Called once after the plugin is fully registered
    async fn on_load(&self, context: &PluginContext) -> PluginResult<()>;

    /// Called once before the plugin is torn down
    async fn on_unload(&self) -> PluginResult<()>;

    /// Run the plugin's main functionality
    async fn execute(&self, input: Value) -> PluginResult<Value>;
}

/// A plugin code module, however it was brought into the process.
///
/// Implementations must return `None` for unknown symbols rather than panic.
pub trait PluginModule: Send + Sync {
    /// Symbols this module defines, merged into the module index on load
    fn symbols(&self) -> Vec<String>;

    fn create_entry(&self, symbol: &str, scope: &ModuleScope) -> Option<Arc<dyn PluginEntry>>;

    fn get_interface(
        &self,
        capability: &str,
        symbol: &str,
        scope: &ModuleScope,
    ) -> Option<InterfaceInstance>;
}

/// Live loader for one plugin
pub trait ModuleLoader: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Symbols the module reports about itself
    fn symbols(&self) -> Vec<String>;

    fn get_interface(&self, capability: &str, symbol: &str) -> Option<InterfaceInstance>;

    fn create_entry(&self, symbol: &str) -> Option<Arc<dyn PluginEntry>>;
}

/// Everything a factory needs to build a loader
#[derive(Clone)]
pub struct LoaderRequest {
    pub plugin_id: String,
    pub module_path: PathBuf,
    pub parent: Arc<HostApplication>,
    pub finder: Arc<dyn PluginFinder>,
}

impl LoaderRequest {
    pub fn scope(&self) -> ModuleScope {
        ModuleScope::new(self.plugin_id.clone(), self.parent.clone(), self.finder.clone())
    }
}

/// Creates loaders. Runs on the blocking pool, so it may do file I/O.
pub trait ModuleLoaderFactory: Send + Sync {
    fn create(&self, request: LoaderRequest) -> PluginResult<Arc<dyn ModuleLoader>>;
}

/// Loader over any [`PluginModule`]
pub struct PluginModuleLoader {
    scope: ModuleScope,
    module: Arc<dyn PluginModule>,
}

impl PluginModuleLoader {
    pub fn new(scope: ModuleScope, module: Arc<dyn PluginModule>) -> Self {
        Self { scope, module }
    }
}

impl ModuleLoader for PluginModuleLoader {
    fn plugin_id(&self) -> &str {
        self.scope.plugin_id()
    }

    fn symbols(&self) -> Vec<String> {
        self.module.symbols()
    }

    fn get_interface(&self, capability: &str, symbol: &str) -> Option<InterfaceInstance> {
        self.module.get_interface(capability, symbol, &self.scope)
    }

    fn create_entry(&self, symbol: &str) -> Option<Arc<dyn PluginEntry>> {
        self.module.create_entry(symbol, &self.scope)
    }
}

type EntryFactory = Arc<dyn Fn(&ModuleScope) -> Arc<dyn PluginEntry> + Send + Sync>;
type InterfaceFactory = Arc<dyn Fn(&ModuleScope) -> InterfaceInstance + Send + Sync>;

/// Module assembled in code from closures
#[derive(Clone, Default)]
pub struct StaticModule {
    entries: HashMap<String, EntryFactory>,
    interfaces: HashMap<String, (String, InterfaceFactory)>,
    extra_symbols: Vec<String>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry<F>(mut self, symbol: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ModuleScope) -> Arc<dyn PluginEntry> + Send + Sync + 'static,
    {
        self.entries.insert(symbol.into(), Arc::new(factory));
        self
    }

    pub fn with_interface<F>(
        mut self,
        capability: impl Into<String>,
        symbol: impl Into<String>,
        factory: F,
    ) -> Self
    where
        F: Fn(&ModuleScope) -> InterfaceInstance + Send + Sync + 'static,
    {
        self.interfaces
            .insert(symbol.into(), (capability.into(), Arc::new(factory)));
        self
    }

    /// Declare a symbol that has no factory, such as a private helper type
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.extra_symbols.push(symbol.into());
        self
    }
}

impl PluginModule for StaticModule {
    fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .entries
            .keys()
            .chain(self.interfaces.keys())
            .chain(self.extra_symbols.iter())
            .cloned()
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    fn create_entry(&self, symbol: &str, scope: &ModuleScope) -> Option<Arc<dyn PluginEntry>> {
        self.entries.get(symbol).map(|factory| factory(scope))
    }

    fn get_interface(
        &self,
        capability: &str,
        symbol: &str,
        scope: &ModuleScope,
    ) -> Option<InterfaceInstance> {
        match self.interfaces.get(symbol) {
            Some((declared, factory)) if declared == capability => Some(factory(scope)),
            _ => None,
        }
    }
}

/// Factory for modules linked into the host, keyed by module path
#[derive(Default)]
pub struct StaticModuleLoaderFactory {
    modules: DashMap<PathBuf, Arc<dyn PluginModule>>,
}

impl StaticModuleLoaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module_path: impl Into<PathBuf>, module: impl PluginModule + 'static) {
        self.modules.insert(module_path.into(), Arc::new(module));
    }

    pub fn unregister(&self, module_path: &Path) -> bool {
        self.modules.remove(module_path).is_some()
    }
}

impl ModuleLoaderFactory for StaticModuleLoaderFactory {
    fn create(&self, request: LoaderRequest) -> PluginResult<Arc<dyn ModuleLoader>> {
        let module = self
            .modules
            .get(&request.module_path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                PluginRuntimeError::loading(
                    &request.plugin_id,
                    format!("no module registered at {}", request.module_path.display()),
                )
            })?;

        Ok(Arc::new(PluginModuleLoader::new(request.scope(), module)))
    }
}
