//! Dependency graph over loaded plugins
//!
//! Edges are never stored as a standalone graph: declared dependencies are
//! read from the plugin records on every query, and runtime edges are
//! recorded when one plugin resolves a symbol owned by another through the
//! [`PluginFinder`]. Traversals are breadth-first over a visited set, so
//! malformed cyclic declarations terminate.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::loader::{InterfaceInstance, ModuleLoader, PluginFinder};

/// Read-only view of plugin state the dependency manager needs
pub trait PluginStateProvider: Send + Sync {
    /// Ids of every currently loaded plugin
    fn loaded_plugin_ids(&self) -> Vec<String>;

    /// Declared dependencies of a plugin, loaded or merely installed
    fn declared_dependencies(&self, plugin_id: &str) -> Vec<String>;

    /// Owner of a symbol according to the module index
    fn symbol_owner(&self, symbol: &str) -> Option<String>;

    /// Live loader of a loaded plugin
    fn loader_of(&self, plugin_id: &str) -> Option<Arc<dyn ModuleLoader>>;
}

/// Dependency manager and cross-plugin finder
pub struct DependencyManager {
    state: Weak<dyn PluginStateProvider>,
    runtime_edges: DashMap<String, HashSet<String>>,
}

impl DependencyManager {
    pub fn new(state: Weak<dyn PluginStateProvider>) -> Self {
        Self {
            state,
            runtime_edges: DashMap::new(),
        }
    }

    fn state(&self) -> Option<Arc<dyn PluginStateProvider>> {
        self.state.upgrade()
    }

    /// Direct dependencies: declared ones followed by recorded runtime edges
    pub fn direct_dependencies(&self, plugin_id: &str) -> Vec<String> {
        let mut deps = self
            .state()
            .map(|state| state.declared_dependencies(plugin_id))
            .unwrap_or_default();

        if let Some(runtime) = self.runtime_edges.get(plugin_id) {
            let mut extra: Vec<&String> = runtime.iter().filter(|d| !deps.contains(d)).collect();
            extra.sort();
            deps.extend(extra.into_iter().cloned());
        }
        deps.retain(|d| d != plugin_id);
        deps
    }

    /// Everything `plugin_id` depends on, transitively, in discovery order
    pub fn find_dependencies_recursive(&self, plugin_id: &str) -> Vec<String> {
        let mut visited = HashSet::from([plugin_id.to_string()]);
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([plugin_id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dep in self.direct_dependencies(&current) {
                if visited.insert(dep.clone()) {
                    ordered.push(dep.clone());
                    queue.push_back(dep);
                }
            }
        }

        ordered
    }

    /// Every loaded plugin that depends on `plugin_id`, transitively, in
    /// discovery order
    pub fn find_dependents_recursive(&self, plugin_id: &str) -> Vec<String> {
        let Some(state) = self.state() else {
            return Vec::new();
        };

        let mut loaded = state.loaded_plugin_ids();
        loaded.sort();
        let edges: Vec<(String, Vec<String>)> = loaded
            .into_iter()
            .map(|id| {
                let deps = self.direct_dependencies(&id);
                (id, deps)
            })
            .collect();

        let mut visited = HashSet::from([plugin_id.to_string()]);
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([plugin_id.to_string()]);

        while let Some(current) = queue.pop_front() {
            for (candidate, deps) in &edges {
                if deps.contains(&current) && visited.insert(candidate.clone()) {
                    ordered.push(candidate.clone());
                    queue.push_back(candidate.clone());
                }
            }
        }

        ordered
    }

    /// Record that `requester` resolved a symbol owned by `provider`
    pub fn record_dependency(&self, requester: &str, provider: &str) {
        if requester == provider {
            return;
        }
        let inserted = self
            .runtime_edges
            .entry(requester.to_string())
            .or_default()
            .insert(provider.to_string());
        if inserted {
            debug!(requester, provider, "recorded runtime dependency");
        }
    }

    /// Drop every runtime edge touching `plugin_id`
    pub fn clear_dependencies_for(&self, plugin_id: &str) {
        self.runtime_edges.remove(plugin_id);
        self.runtime_edges.retain(|_, providers| {
            providers.remove(plugin_id);
            !providers.is_empty()
        });
    }
}

impl PluginFinder for DependencyManager {
    fn find_interface(
        &self,
        requester: &str,
        capability: &str,
        symbol: &str,
    ) -> Option<InterfaceInstance> {
        let state = self.state()?;
        let owner = state.symbol_owner(symbol)?;
        if owner == requester {
            return None;
        }

        let Some(loader) = state.loader_of(&owner) else {
            warn!(symbol, owner = %owner, "symbol indexed for a plugin that is not loaded");
            return None;
        };

        let instance = loader.get_interface(capability, symbol)?;
        self.record_dependency(requester, &owner);
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FixedState {
        loaded: Vec<String>,
        declared: HashMap<String, Vec<String>>,
    }

    impl FixedState {
        fn with(mut self, id: &str, deps: &[&str]) -> Self {
            self.loaded.push(id.to_string());
            self.declared
                .insert(id.to_string(), deps.iter().map(|d| d.to_string()).collect());
            self
        }
    }

    impl PluginStateProvider for FixedState {
        fn loaded_plugin_ids(&self) -> Vec<String> {
            self.loaded.clone()
        }

        fn declared_dependencies(&self, plugin_id: &str) -> Vec<String> {
            self.declared.get(plugin_id).cloned().unwrap_or_default()
        }

        fn symbol_owner(&self, _symbol: &str) -> Option<String> {
            None
        }

        fn loader_of(&self, _plugin_id: &str) -> Option<Arc<dyn ModuleLoader>> {
            None
        }
    }

    fn manager(state: &Arc<dyn PluginStateProvider>) -> DependencyManager {
        DependencyManager::new(Arc::downgrade(state))
    }

    #[test]
    fn test_transitive_closures() {
        let state: Arc<dyn PluginStateProvider> = Arc::new(
            FixedState::default()
                .with("core", &[])
                .with("net", &["core"])
                .with("ui", &["net", "core"])
                .with("app", &["ui"]),
        );
        let deps = manager(&state);

        assert_eq!(deps.find_dependencies_recursive("app"), vec!["ui", "net", "core"]);
        assert_eq!(deps.find_dependents_recursive("core"), vec!["net", "ui", "app"]);
        assert!(deps.find_dependents_recursive("app").is_empty());
    }

    #[test]
    fn test_cycles_terminate() {
        let state: Arc<dyn PluginStateProvider> =
            Arc::new(FixedState::default().with("a", &["b"]).with("b", &["a"]));
        let deps = manager(&state);

        assert_eq!(deps.find_dependencies_recursive("a"), vec!["b"]);
        assert_eq!(deps.find_dependents_recursive("a"), vec!["b"]);
    }

    #[test]
    fn test_runtime_edges() {
        let state: Arc<dyn PluginStateProvider> =
            Arc::new(FixedState::default().with("a", &[]).with("b", &[]));
        let deps = manager(&state);

        deps.record_dependency("b", "a");
        deps.record_dependency("b", "b");
        assert_eq!(deps.find_dependents_recursive("a"), vec!["b"]);

        deps.clear_dependencies_for("a");
        assert!(deps.find_dependents_recursive("a").is_empty());
    }

    #[test]
    fn test_dropped_state_yields_empty() {
        let state: Arc<dyn PluginStateProvider> = Arc::new(FixedState::default().with("a", &["b"]));
        let deps = manager(&state);
        drop(state);

        assert!(deps.find_dependencies_recursive("a").is_empty());
        assert!(deps.find_dependents_recursive("a").is_empty());
    }
}
