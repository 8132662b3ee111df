//! Plugin lifecycle management
//!
//! Drives plugins through `Unloaded -> Loading -> Loaded -> Active ->
//! Unloading -> Unloaded`. Every public operation holds a single driver guard
//! so writers to the shared tables never interleave; internal helpers skip the
//! guard so rollback paths can reuse them. Plugin hooks run under that
//! guard, so lifecycle calls made from inside a hook are refused.
//!
//! Loading is fan-out/fan-in per batch: the load step (loader creation and
//! index registration) runs on the blocking pool, instantiation on the async
//! pool, and each step is joined before the next begins. A batch either
//! becomes fully active or leaves nothing behind.

use std::collections::HashSet;
use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::FrameworkContext;
use crate::crash;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::index::{read_symbol_index, SYMBOL_INDEX_FILENAME};
use crate::loader::{LoaderRequest, ModuleLoader, ModuleScope, PluginContext, PluginEntry, PluginFinder};
use crate::model::{LoadedPlugin, PluginInfo};

/// Observable lifecycle state of a plugin id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Not loaded
    Unloaded,
    /// Load step in progress
    Loading,
    /// Loader published, entry point not instantiated yet
    Loaded,
    /// Entry instantiated and load hook invoked
    Active,
    /// Teardown in progress
    Unloading,
}

/// Output of the load step, not yet visible in the loaded table
struct StagedPlugin {
    info: PluginInfo,
    loader: Arc<dyn ModuleLoader>,
}

/// Plugin lifecycle manager
pub struct LifecycleManager {
    context: Arc<FrameworkContext>,
    driver: Mutex<()>,
    in_flight: DashMap<String, PluginState>,
}

impl LifecycleManager {
    pub fn new(context: Arc<FrameworkContext>) -> Self {
        Self {
            context,
            driver: Mutex::new(()),
            in_flight: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<FrameworkContext> {
        &self.context
    }

    pub fn state(&self, plugin_id: &str) -> PluginState {
        if let Some(state) = self.in_flight.get(plugin_id) {
            return *state;
        }
        if self.context.instance(plugin_id).is_some() {
            PluginState::Active
        } else if self.context.is_loaded(plugin_id) {
            PluginState::Loaded
        } else {
            PluginState::Unloaded
        }
    }

    /// Launch a plugin, reloading it and its dependents if already loaded
    pub async fn launch(&self, plugin_id: &str) -> bool {
        if Self::called_from_hook("launch") {
            return false;
        }
        let _driver = self.driver.lock().await;

        if self.context.is_loaded(plugin_id) {
            return self.chained_reload(plugin_id).await;
        }

        let info = match self.context.registry().get_plugin_by_id(plugin_id) {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(plugin_id, "launch failed: plugin is not installed");
                return false;
            }
            Err(e) => {
                error!(plugin_id, error = %e, "launch failed: registry lookup failed");
                return false;
            }
        };

        self.batch_load(vec![info]).await
    }

    /// Unload a plugin. Returns false, and does nothing, if it was not loaded.
    pub async fn unload(&self, plugin_id: &str) -> bool {
        if Self::called_from_hook("unload") {
            return false;
        }
        let _driver = self.driver.lock().await;
        self.unload_inner(plugin_id).await
    }

    /// Load every enabled plugin that is not loaded yet as one batch.
    ///
    /// Returns the number of plugins activated, 0 if the batch was aborted.
    pub async fn load_enabled_plugins(&self) -> usize {
        if Self::called_from_hook("load_enabled_plugins") {
            return 0;
        }
        let _driver = self.driver.lock().await;

        let installed = match self.context.registry().get_all_plugins() {
            Ok(plugins) => plugins,
            Err(e) => {
                error!(error = %e, "failed to read installed plugins");
                return 0;
            }
        };

        let batch: Vec<PluginInfo> = installed
            .into_iter()
            .filter(|info| info.enabled && !self.context.is_loaded(&info.id))
            .collect();

        if batch.is_empty() {
            debug!("no enabled plugins waiting to load");
            return 0;
        }

        let count = batch.len();
        if self.batch_load(batch).await {
            info!(count, "loaded enabled plugins");
            count
        } else {
            0
        }
    }

    /// Load an explicit set of installed plugins as one batch
    pub async fn launch_batch(&self, plugin_ids: &[String]) -> bool {
        if Self::called_from_hook("launch_batch") {
            return false;
        }
        let _driver = self.driver.lock().await;

        let mut batch = Vec::with_capacity(plugin_ids.len());
        for plugin_id in plugin_ids {
            if self.context.is_loaded(plugin_id) {
                debug!(plugin_id = %plugin_id, "already loaded, skipped from batch");
                continue;
            }
            match self.context.registry().get_plugin_by_id(plugin_id) {
                Ok(Some(info)) => batch.push(info),
                _ => {
                    warn!(plugin_id = %plugin_id, "batch aborted: plugin is not installed");
                    return false;
                }
            }
        }

        self.batch_load(batch).await
    }

    /// Unload every loaded plugin, dependents before their dependencies
    pub async fn unload_all(&self) -> usize {
        if Self::called_from_hook("unload_all") {
            return 0;
        }
        let _driver = self.driver.lock().await;

        let mut order: Vec<String> = Vec::new();
        let mut loaded: Vec<String> = self.context.loaded().load().keys().cloned().collect();
        loaded.sort();
        for plugin_id in loaded {
            if order.contains(&plugin_id) {
                continue;
            }
            let mut chain = vec![plugin_id.clone()];
            chain.extend(self.context.dependencies().find_dependents_recursive(&plugin_id));
            for id in chain.into_iter().rev() {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
        }

        let mut count = 0;
        for plugin_id in order {
            if self.unload_inner(&plugin_id).await {
                count += 1;
            }
        }
        count
    }

    /// The driver guard is already held by whoever runs the hook
    fn called_from_hook(operation: &'static str) -> bool {
        let nested = crash::is_managed_call();
        if nested {
            warn!(operation, "lifecycle call from inside a plugin hook refused");
        }
        nested
    }

    async fn chained_reload(&self, plugin_id: &str) -> bool {
        let mut chain = vec![plugin_id.to_string()];
        chain.extend(self.context.dependencies().find_dependents_recursive(plugin_id));

        let mut infos = Vec::with_capacity(chain.len());
        for id in &chain {
            match self.context.registry().get_plugin_by_id(id) {
                Ok(Some(info)) => infos.push(info),
                _ => {
                    warn!(plugin_id = %id, root = plugin_id, "reload aborted: plugin info not found");
                    return false;
                }
            }
        }

        info!(plugin_id, chain = ?chain, "reloading plugin chain");

        for id in chain.iter().rev() {
            self.unload_inner(id).await;
        }

        self.batch_load(infos).await
    }

    async fn batch_load(&self, mut infos: Vec<PluginInfo>) -> bool {
        let mut seen = HashSet::new();
        infos.retain(|info| seen.insert(info.id.clone()));
        if infos.is_empty() {
            return true;
        }

        let ids: Vec<String> = infos.iter().map(|info| info.id.clone()).collect();
        for id in &ids {
            self.in_flight.insert(id.clone(), PluginState::Loading);
        }

        let staged = self.load_step(infos).await;
        for id in &ids {
            self.in_flight.remove(id);
        }

        let staged = match staged {
            Ok(staged) => staged,
            Err(loaded_ok) => {
                for plugin in &loaded_ok {
                    self.discard_staged(plugin);
                }
                for id in &ids {
                    self.context.index().unregister(id);
                }
                warn!(batch = ?ids, "batch load failed, rolled back");
                return false;
            }
        };

        self.context.loaded().update(|table| {
            for plugin in staged {
                let id = plugin.info.id.clone();
                table.insert(id, Arc::new(LoadedPlugin::new(plugin.info, plugin.loader)));
            }
        });

        let instances = self.instantiate_step(&ids).await;

        let (instances, failed) = match instances {
            Ok(instances) => (instances, false),
            Err(partial) => (partial, true),
        };

        self.context.instances().update(|table| {
            for (id, entry) in instances {
                table.insert(id, entry);
            }
        });

        if failed {
            for id in &ids {
                self.unload_inner(id).await;
            }
            warn!(batch = ?ids, "batch instantiation failed, rolled back");
            return false;
        }

        info!(batch = ?ids, "plugins activated");
        true
    }

    /// Run the load step for every plugin concurrently.
    ///
    /// On failure returns whatever did load so it can be discarded.
    async fn load_step(&self, infos: Vec<PluginInfo>) -> Result<Vec<StagedPlugin>, Vec<StagedPlugin>> {
        let mut tasks = JoinSet::new();
        for info in infos {
            let context = self.context.clone();
            tasks.spawn_blocking(move || {
                let id = info.id.clone();
                let result = crash::managed_blocking(|| load_module(&context, info));
                (id, result)
            });
        }

        let mut staged = Vec::new();
        let mut failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(plugin))) => staged.push(plugin),
                Ok((plugin_id, Err(e))) => {
                    error!(plugin_id = %plugin_id, error = %e, category = %e.category(), "plugin load failed");
                    failed = true;
                }
                Err(e) => {
                    error!(error = %e, "plugin load task panicked");
                    failed = true;
                }
            }
        }

        if failed {
            Err(staged)
        } else {
            Ok(staged)
        }
    }

    /// Instantiate every published plugin concurrently
    async fn instantiate_step(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Arc<dyn PluginEntry>)>, Vec<(String, Arc<dyn PluginEntry>)>> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let Some(plugin) = self.context.loaded_plugin(id) else {
                error!(plugin_id = %id, "plugin vanished before instantiation");
                return Err(Vec::new());
            };
            let context = self.context.clone();
            tasks.spawn(crash::managed(async move {
                let result = instantiate(&context, &plugin).await;
                (plugin.info.id.clone(), result)
            }));
        }

        let mut instances = Vec::new();
        let mut failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((plugin_id, Ok(entry))) => instances.push((plugin_id, entry)),
                Ok((plugin_id, Err(e))) => {
                    error!(plugin_id = %plugin_id, error = %e, category = %e.category(), "plugin instantiation failed");
                    failed = true;
                }
                Err(e) => {
                    error!(error = %e, "plugin instantiation task panicked");
                    failed = true;
                }
            }
        }

        if failed {
            Err(instances)
        } else {
            Ok(instances)
        }
    }

    fn discard_staged(&self, plugin: &StagedPlugin) {
        let removed = self.context.index().unregister(&plugin.info.id);
        debug!(plugin_id = %plugin.info.id, removed, "discarded staged plugin");
    }

    async fn unload_inner(&self, plugin_id: &str) -> bool {
        let Some(loaded) = self.context.loaded_plugin(plugin_id) else {
            warn!(plugin_id, "unload skipped: plugin is not loaded");
            return false;
        };
        self.in_flight.insert(plugin_id.to_string(), PluginState::Unloading);

        // The hook runs while the plugin is still fully registered.
        if let Some(instance) = self.context.instance(plugin_id) {
            let hook = tokio::spawn(crash::managed(async move { instance.on_unload().await }));
            match hook.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(plugin_id, error = %e, "on_unload failed"),
                Err(e) => error!(plugin_id, error = %e, "on_unload panicked"),
            }
        }

        self.context.instances().update(|table| table.remove(plugin_id));
        self.context.loaded().update(|table| table.remove(plugin_id));
        self.context.proxies().unregister_plugin(plugin_id);
        self.context.dependencies().clear_dependencies_for(plugin_id);
        self.context.resources().remove_plugin_resources(plugin_id);
        let purged = self.context.index().unregister(plugin_id);

        self.in_flight.remove(plugin_id);
        drop(loaded);

        info!(plugin_id, purged, "plugin unloaded");
        true
    }
}

/// Load step: create the loader and register the plugin's symbols
fn load_module(context: &FrameworkContext, info: PluginInfo) -> PluginResult<StagedPlugin> {
    let finder: Arc<dyn PluginFinder> = context.dependencies().clone();
    let request = LoaderRequest {
        plugin_id: info.id.clone(),
        module_path: info.path.clone(),
        parent: context.host().clone(),
        finder,
    };
    let loader = context.loader_factory().create(request)?;

    let mut symbols = match info.path.parent() {
        Some(dir) => read_symbol_index(&dir.join(SYMBOL_INDEX_FILENAME))?,
        None => Vec::new(),
    };
    symbols.extend(loader.symbols());

    let count = context.index().register(&info.id, symbols)?;
    debug!(plugin_id = %info.id, symbols = count, "module loaded");

    Ok(StagedPlugin { info, loader })
}

/// Instantiate step: mount resources, register components, create the entry
/// and run its load hook
async fn instantiate(context: &FrameworkContext, plugin: &LoadedPlugin) -> PluginResult<Arc<dyn PluginEntry>> {
    let info = &plugin.info;

    context.resources().load_plugin_resources(&info.id, &info.path)?;
    context
        .proxies()
        .register_static_receivers(&info.id, &info.static_receivers)?;
    context.proxies().register_providers(&info.id, &info.providers)?;

    let entry = plugin
        .loader
        .create_entry(&info.entry_point)
        .ok_or_else(|| PluginRuntimeError::EntryPointMissing {
            plugin_id: info.id.clone(),
            entry_point: info.entry_point.clone(),
        })?;

    let finder: Arc<dyn PluginFinder> = context.dependencies().clone();
    let scope = ModuleScope::new(info.id.clone(), context.host().clone(), finder);
    let plugin_context = PluginContext::new(info.clone(), scope);

    if let Err(e) = entry.on_load(&plugin_context).await {
        error!(plugin_id = %info.id, error = %e, "on_load failed");
    }

    Ok(entry)
}
