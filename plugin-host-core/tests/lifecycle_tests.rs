//! Lifecycle integration tests
//!
//! Scenarios driven through the public runtime surface with statically
//! linked plugin modules:
//! 1. Unloading twice is a safe no-op
//! 2. A batch with one broken plugin leaves nothing loaded
//! 3. Every indexed symbol belongs to a loaded plugin
//! 4. Reloading a plugin rebuilds its dependents
//! 5. Runtime lookups create dependency edges
//! 6. Cyclic declarations terminate
//! 7. Installed plugins load through `load_enabled_plugins`
//! 8. A reload whose dependent has no installed record changes nothing
//! 9. Lifecycle calls from inside a load hook are refused

use async_trait::async_trait;
use plugin_host_core::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Counter {
    loads: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
}

#[async_trait]
impl PluginEntry for Counter {
    async fn on_load(&self, _context: &PluginContext) -> PluginResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_unload(&self) -> PluginResult<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, input: Value) -> PluginResult<Value> {
        Ok(json!({ "echo": input }))
    }
}

/// Looks up another plugin's interface while loading
struct Consumer {
    symbol: String,
}

#[async_trait]
impl PluginEntry for Consumer {
    async fn on_load(&self, context: &PluginContext) -> PluginResult<()> {
        context
            .find_interface("Greeter", &self.symbol)
            .map(|_| ())
            .ok_or_else(|| PluginRuntimeError::ExecutionFailed(format!("{} unavailable", self.symbol)))
    }

    async fn on_unload(&self) -> PluginResult<()> {
        Ok(())
    }

    async fn execute(&self, _input: Value) -> PluginResult<Value> {
        Ok(Value::Null)
    }
}

/// Tries to launch another plugin through the host-registered runtime
struct Reentrant {
    target: String,
    nested: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl PluginEntry for Reentrant {
    async fn on_load(&self, context: &PluginContext) -> PluginResult<()> {
        let runtime = context
            .find_interface("Runtime", "host::Runtime")
            .and_then(|instance| instance.downcast::<PluginRuntime>().ok())
            .ok_or_else(|| PluginRuntimeError::ExecutionFailed("runtime unavailable".to_string()))?;
        let launched = runtime.launch_plugin(&Caller::Host, &self.target).await;
        *self.nested.lock().unwrap() = Some(launched);
        Ok(())
    }

    async fn on_unload(&self) -> PluginResult<()> {
        Ok(())
    }

    async fn execute(&self, _input: Value) -> PluginResult<Value> {
        Ok(Value::Null)
    }
}

struct Fixture {
    runtime: PluginRuntime,
    factory: Arc<StaticModuleLoaderFactory>,
    loads: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(plugins: Vec<PluginInfo>) -> Self {
        let factory = Arc::new(StaticModuleLoaderFactory::new());
        let config = RuntimeConfig {
            install_crash_handler: false,
            load_enabled_on_start: false,
            ..RuntimeConfig::default()
        };
        let context = FrameworkContext::builder(config)
            .registry(Arc::new(InMemoryPluginRegistry::with_plugins(plugins)))
            .loader_factory(factory.clone())
            .build()
            .unwrap();

        Self {
            runtime: PluginRuntime::new(context),
            factory,
            loads: Arc::new(AtomicUsize::new(0)),
            unloads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a counting plugin module under `/plugins/<id>/module`
    fn counting_module(&self, id: &str) {
        let loads = self.loads.clone();
        let unloads = self.unloads.clone();
        self.factory.register(
            module_path(id),
            StaticModule::new()
                .with_entry(format!("{id}::Entry"), move |_| {
                    Arc::new(Counter {
                        loads: loads.clone(),
                        unloads: unloads.clone(),
                    }) as Arc<dyn PluginEntry>
                })
                .with_interface("Greeter", format!("{id}::Greeter"), |_| {
                    Arc::new("hello".to_string()) as InterfaceInstance
                }),
        );
    }

    fn context(&self) -> &Arc<FrameworkContext> {
        self.runtime.context()
    }

    fn loaded_ids(&self) -> HashSet<String> {
        self.context().loaded().load().keys().cloned().collect()
    }

    fn instance_ptr(&self, id: &str) -> *const () {
        let instance = self.context().instance(id).unwrap();
        Arc::as_ptr(&instance).cast::<()>()
    }

    fn plugin_state(&self, id: &str) -> PluginState {
        self.runtime.plugin_state(id)
    }
}

fn module_path(id: &str) -> String {
    format!("/plugins/{id}/module")
}

fn plugin(id: &str) -> PluginInfo {
    PluginInfo::new(id, id, module_path(id), format!("{id}::Entry"))
}

#[tokio::test]
async fn test_unload_is_idempotent() {
    let fixture = Fixture::new(vec![plugin("p1")]);
    fixture.counting_module("p1");

    assert!(fixture.runtime.launch_plugin(&Caller::Host, "p1").await);
    assert!(fixture.runtime.unload_plugin(&Caller::Host, "p1").await);
    let after_first = fixture.loaded_ids();

    assert!(!fixture.runtime.unload_plugin(&Caller::Host, "p1").await);
    assert_eq!(fixture.loaded_ids(), after_first);
    assert!(fixture.context().index().is_empty());
    assert_eq!(fixture.unloads.load(Ordering::SeqCst), 1, "teardown hook runs once");
}

#[tokio::test]
async fn test_batch_with_missing_entry_point_rolls_back() {
    let mut p4 = plugin("p4");
    p4.entry_point = "p4::Missing".to_string();
    let fixture = Fixture::new(vec![plugin("p3"), p4]);
    fixture.counting_module("p3");
    fixture.counting_module("p4");

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 0);

    let loaded = fixture.loaded_ids();
    assert!(!loaded.contains("p3"), "valid member must not survive a failed batch");
    assert!(!loaded.contains("p4"));
    assert!(fixture.context().instances().load().is_empty());
    assert!(fixture.context().index().is_empty());
}

#[tokio::test]
async fn test_batch_with_unloadable_module_rolls_back() {
    let fixture = Fixture::new(vec![plugin("p3"), plugin("p4")]);
    fixture.counting_module("p3");

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 0);
    assert!(fixture.loaded_ids().is_empty());
    assert!(fixture.context().index().is_empty());
    assert_eq!(fixture.loads.load(Ordering::SeqCst), 0, "nothing is instantiated");
}

#[tokio::test]
async fn test_index_only_maps_to_loaded_plugins() {
    let fixture = Fixture::new(vec![plugin("p1"), plugin("p2"), plugin("p3")]);
    for id in ["p1", "p2", "p3"] {
        fixture.counting_module(id);
    }

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 3);
    assert!(fixture.runtime.unload_plugin(&Caller::Host, "p2").await);

    let loaded = fixture.loaded_ids();
    let owners = fixture.context().index().owners();
    assert!(owners.is_subset(&loaded), "index owners {owners:?} not within {loaded:?}");
    assert_eq!(
        fixture.context().index().symbols_of("p1"),
        vec!["p1::Entry".to_string(), "p1::Greeter".to_string()]
    );
    assert!(fixture.context().index().symbols_of("p2").is_empty());
}

#[tokio::test]
async fn test_reload_rebuilds_declared_dependents() {
    let fixture = Fixture::new(vec![plugin("p1"), plugin("p2").with_dependency("p1")]);
    fixture.counting_module("p1");
    fixture.counting_module("p2");

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 2);
    let p1_before = fixture.instance_ptr("p1");
    let p2_before = fixture.instance_ptr("p2");

    // Hold the old instances so their allocations cannot be reused.
    let _old = (
        fixture.context().instance("p1").unwrap(),
        fixture.context().instance("p2").unwrap(),
    );

    assert!(fixture.runtime.launch_plugin(&Caller::Host, "p1").await);

    assert_ne!(fixture.instance_ptr("p1"), p1_before);
    assert_ne!(fixture.instance_ptr("p2"), p2_before, "dependent must be rebuilt");
    assert_eq!(fixture.plugin_state("p2"), PluginState::Active);
    assert_eq!(fixture.unloads.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.loads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_reload_aborts_when_dependent_record_missing() {
    let fixture = Fixture::new(vec![plugin("p1"), plugin("p2").with_dependency("p1")]);
    fixture.counting_module("p1");
    fixture.counting_module("p2");

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 2);
    let p1_before = fixture.instance_ptr("p1");
    let p2_before = fixture.instance_ptr("p2");
    let _old = (
        fixture.context().instance("p1").unwrap(),
        fixture.context().instance("p2").unwrap(),
    );

    assert!(fixture.context().registry().remove_plugin("p2").unwrap());
    assert!(!fixture.runtime.launch_plugin(&Caller::Host, "p1").await);

    assert_eq!(fixture.plugin_state("p1"), PluginState::Active);
    assert_eq!(fixture.plugin_state("p2"), PluginState::Active);
    assert_eq!(fixture.instance_ptr("p1"), p1_before);
    assert_eq!(fixture.instance_ptr("p2"), p2_before);
    assert_eq!(fixture.unloads.load(Ordering::SeqCst), 0, "nothing is torn down");
    assert_eq!(fixture.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_load_hook_cannot_reenter_lifecycle() {
    let factory = Arc::new(StaticModuleLoaderFactory::new());
    let config = RuntimeConfig {
        install_crash_handler: false,
        load_enabled_on_start: false,
        ..RuntimeConfig::default()
    };
    let context = FrameworkContext::builder(config)
        .registry(Arc::new(InMemoryPluginRegistry::with_plugins(vec![plugin("p1"), plugin("p2")])))
        .loader_factory(factory.clone())
        .build()
        .unwrap();
    let runtime = Arc::new(PluginRuntime::new(context));
    runtime
        .context()
        .host()
        .register_interface("host::Runtime", runtime.clone() as InterfaceInstance);

    let nested = Arc::new(Mutex::new(None));
    let hook_nested = nested.clone();
    factory.register(
        module_path("p1"),
        StaticModule::new().with_entry("p1::Entry", move |_| {
            Arc::new(Reentrant {
                target: "p2".to_string(),
                nested: hook_nested.clone(),
            }) as Arc<dyn PluginEntry>
        }),
    );
    factory.register(
        module_path("p2"),
        StaticModule::new().with_entry("p2::Entry", |_| {
            Arc::new(Counter {
                loads: Arc::new(AtomicUsize::new(0)),
                unloads: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn PluginEntry>
        }),
    );

    let launched = tokio::time::timeout(
        Duration::from_secs(5),
        runtime.launch_plugin(&Caller::Host, "p1"),
    )
    .await
    .expect("nested lifecycle call must not hang");

    assert!(launched);
    assert_eq!(*nested.lock().unwrap(), Some(false));
    assert_eq!(runtime.plugin_state("p2"), PluginState::Unloaded);

    // Outside a hook the same call goes through.
    assert!(runtime.launch_plugin(&Caller::Host, "p2").await);
    assert_eq!(runtime.plugin_state("p2"), PluginState::Active);
}

#[tokio::test]
async fn test_runtime_lookup_records_dependency() {
    let fixture = Fixture::new(vec![plugin("p1"), plugin("p2")]);
    fixture.counting_module("p1");
    fixture.factory.register(
        module_path("p2"),
        StaticModule::new().with_entry("p2::Entry", |_| {
            Arc::new(Consumer {
                symbol: "p1::Greeter".to_string(),
            }) as Arc<dyn PluginEntry>
        }),
    );

    assert!(fixture.runtime.launch_plugin(&Caller::Host, "p1").await);
    assert!(fixture.runtime.launch_plugin(&Caller::Host, "p2").await);

    let dependents = fixture
        .runtime
        .get_plugin_dependents_chain(&Caller::Host, "p1")
        .await;
    assert_eq!(dependents, vec!["p2".to_string()]);

    let p2_before = fixture.instance_ptr("p2");
    let _old = fixture.context().instance("p2").unwrap();
    assert!(fixture.runtime.launch_plugin(&Caller::Host, "p1").await);
    assert_ne!(fixture.instance_ptr("p2"), p2_before);

    // Unloading the consumer drops the observed edge.
    assert!(fixture.runtime.unload_plugin(&Caller::Host, "p2").await);
    assert!(fixture
        .runtime
        .get_plugin_dependents_chain(&Caller::Host, "p1")
        .await
        .is_empty());
}

#[tokio::test]
async fn test_cyclic_dependencies_terminate() {
    let fixture = Fixture::new(vec![
        plugin("a").with_dependency("b"),
        plugin("b").with_dependency("a"),
    ]);
    fixture.counting_module("a");
    fixture.counting_module("b");

    assert_eq!(fixture.runtime.load_enabled_plugins(&Caller::Host).await, 2);

    let dependencies = fixture.runtime.get_plugin_dependencies_chain(&Caller::Host, "a").await;
    let dependents = fixture.runtime.get_plugin_dependents_chain(&Caller::Host, "a").await;
    assert_eq!(dependencies, vec!["b".to_string()]);
    assert_eq!(dependents, vec!["b".to_string()]);

    // A reload over the cycle still settles with both plugins active.
    assert!(fixture.runtime.launch_plugin(&Caller::Host, "a").await);
    assert_eq!(fixture.loaded_ids().len(), 2);
}

#[tokio::test]
async fn test_installed_plugin_loads_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(StaticModuleLoaderFactory::new());
    let config = RuntimeConfig {
        plugins_dir: dir.path().join("plugins"),
        registry_file: dir.path().join("plugins/registry.json"),
        validation_strategy: ValidationStrategy::Insecure,
        install_crash_handler: false,
        load_enabled_on_start: false,
        ..RuntimeConfig::default()
    };
    let installed_module = config.plugin_dir("p1").join("p1.so");
    let context = FrameworkContext::builder(config)
        .loader_factory(factory.clone())
        .build()
        .unwrap();
    let runtime = PluginRuntime::new(context);

    factory.register(
        installed_module,
        StaticModule::new().with_entry("p1::Entry", |_| {
            Arc::new(Counter {
                loads: Arc::new(AtomicUsize::new(0)),
                unloads: Arc::new(AtomicUsize::new(0)),
            }) as Arc<dyn PluginEntry>
        }),
    );

    let module = dir.path().join("p1.so");
    std::fs::write(&module, b"module").unwrap();
    let manifest = PluginManifest {
        id: "p1".to_string(),
        name: "P1".to_string(),
        description: "first plugin".to_string(),
        version: PluginVersion::new(1, "1.0.0"),
        entry_point: "p1::Entry".to_string(),
        dependencies: Vec::new(),
        static_receivers: Vec::new(),
        providers: Vec::new(),
    };
    let package = PluginPackage::new(manifest, &module).with_symbols(["p1::Helper"]);

    let result = runtime.install_plugin(&Caller::Host, package, false).await;
    assert!(result.is_success(), "{result:?}");
    assert!(dir.path().join("plugins/registry.json").is_file(), "registry flushed");

    assert_eq!(runtime.load_enabled_plugins(&Caller::Host).await, 1);
    assert!(runtime.get_plugin_info(&Caller::Host, "p1").await.is_some());
    assert_eq!(
        runtime.context().index().symbols_of("p1"),
        vec!["p1::Entry".to_string(), "p1::Helper".to_string()]
    );

    let instance = runtime.get_plugin_instance(&Caller::Host, "p1").await.unwrap();
    let reply = instance.execute(json!("hi")).await.unwrap();
    assert_eq!(reply, json!({ "echo": "hi" }));

    assert!(runtime.uninstall_plugin(&Caller::Host, "p1").await);
    assert!(!runtime.is_plugin_loaded("p1"));
    assert!(runtime.all_installed_plugins(&Caller::Host).await.is_empty());
}
