//! Native plugin support
//!
//! Loads plugin modules from shared libraries with `libloading`. A native
//! plugin is a `cdylib` built against this crate that exports two symbols,
//! both generated by [`declare_plugin_module!`]:
//!
//! - `plugin_host_api_version` returning [`HOST_API_VERSION`]
//! - `plugin_module_create` returning a boxed [`PluginModule`]
//!
//! The module is passed across the boundary as a Rust trait object, so the
//! plugin must be built with the same compiler as the host.
//!
//! Entries and interfaces handed out by a native module run code from its
//! library, so they may outlive the loader that produced them. Entries hold
//! the library. Interfaces are tracked weakly. When the module is dropped its
//! library is parked and only unmapped by a sweep that finds no live entry or
//! interface left, see [`release_retired_libraries`].

use async_trait::async_trait;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::error::{PluginResult, PluginRuntimeError};
use crate::loader::{
    InterfaceInstance, LoaderRequest, ModuleLoader, ModuleLoaderFactory, ModuleScope,
    PluginContext, PluginEntry, PluginModule, PluginModuleLoader,
};

/// ABI revision of the native module interface
pub const HOST_API_VERSION: u32 = 1;

pub const CREATE_SYMBOL: &[u8] = b"plugin_module_create\0";
pub const API_VERSION_SYMBOL: &[u8] = b"plugin_host_api_version\0";

/// Constructor exported by native modules. Returns null on failure.
pub type PluginModuleCreate = unsafe extern "C" fn() -> *mut Box<dyn PluginModule>;
type ApiVersionFn = unsafe extern "C" fn() -> u32;

/// Export a [`PluginModule`] from a `cdylib`.
///
/// A panic in the constructor is caught on the plugin side and reported to
/// the host as a null module.
///
/// ```ignore
/// plugin_host_core::declare_plugin_module!(GreeterModule::default());
/// ```
#[macro_export]
macro_rules! declare_plugin_module {
    ($constructor:expr) => {
        #[no_mangle]
        pub extern "C" fn plugin_host_api_version() -> u32 {
            $crate::native::HOST_API_VERSION
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn plugin_module_create(
        ) -> *mut ::std::boxed::Box<dyn $crate::loader::PluginModule> {
            ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                let module: ::std::boxed::Box<dyn $crate::loader::PluginModule> =
                    ::std::boxed::Box::new($constructor);
                ::std::boxed::Box::into_raw(::std::boxed::Box::new(module))
            }))
            .unwrap_or(::std::ptr::null_mut())
        }
    };
}

static RETIRED_LIBRARIES: LibraryPark<Library> = LibraryPark::new();

/// Unmap retired native libraries that nothing refers to any more.
///
/// Returns the number of libraries still parked. Also runs before every
/// native module is opened.
pub fn release_retired_libraries() -> usize {
    RETIRED_LIBRARIES.sweep()
}

/// A loaded library plus weak handles to the interfaces created from it
struct LibraryHandle<L> {
    _library: L,
    interfaces: Mutex<Vec<Weak<dyn Any + Send + Sync>>>,
}

impl<L> LibraryHandle<L> {
    fn new(library: L) -> Self {
        Self {
            _library: library,
            interfaces: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, instance: &InterfaceInstance) {
        let mut interfaces = self.interfaces.lock();
        interfaces.retain(|handle| handle.strong_count() > 0);
        interfaces.push(Arc::downgrade(instance));
    }

    fn interfaces_in_use(&self) -> bool {
        self.interfaces
            .lock()
            .iter()
            .any(|handle| handle.strong_count() > 0)
    }
}

/// Libraries whose module is gone but whose code may still be referenced
struct LibraryPark<L> {
    retired: Mutex<Vec<Arc<LibraryHandle<L>>>>,
}

impl<L> LibraryPark<L> {
    const fn new() -> Self {
        Self {
            retired: parking_lot::const_mutex(Vec::new()),
        }
    }

    fn retire(&self, handle: Arc<LibraryHandle<L>>) {
        self.retired.lock().push(handle);
    }

    fn sweep(&self) -> usize {
        let (parked, released) = {
            let mut retired = self.retired.lock();
            let (keep, release): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|handle| Arc::strong_count(handle) > 1 || handle.interfaces_in_use());
            *retired = keep;
            (retired.len(), release)
        };
        if !released.is_empty() {
            debug!(released = released.len(), parked, "released retired native libraries");
        }
        // Unmapping runs library destructors; keep it outside the lock.
        drop(released);
        parked
    }
}

/// Entry that keeps its library mapped for as long as the host holds it.
///
/// Field order matters: the inner entry must drop before the library.
struct NativeEntry<L: Send + Sync + 'static> {
    inner: Arc<dyn PluginEntry>,
    _library: Arc<LibraryHandle<L>>,
}

#[async_trait]
impl<L: Send + Sync + 'static> PluginEntry for NativeEntry<L> {
    async fn on_load(&self, context: &PluginContext) -> PluginResult<()> {
        self.inner.on_load(context).await
    }

    async fn on_unload(&self) -> PluginResult<()> {
        self.inner.on_unload().await
    }

    async fn execute(&self, input: Value) -> PluginResult<Value> {
        self.inner.execute(input).await
    }
}

/// Module plus the library its code lives in
struct NativeModule<L: Send + Sync + 'static> {
    module: Option<Box<dyn PluginModule>>,
    library: Arc<LibraryHandle<L>>,
    park: &'static LibraryPark<L>,
}

impl<L: Send + Sync + 'static> NativeModule<L> {
    fn new(module: Box<dyn PluginModule>, library: L, park: &'static LibraryPark<L>) -> Self {
        Self {
            module: Some(module),
            library: Arc::new(LibraryHandle::new(library)),
            park,
        }
    }
}

impl<L: Send + Sync + 'static> Drop for NativeModule<L> {
    fn drop(&mut self) {
        drop(self.module.take());
        self.park.retire(self.library.clone());
    }
}

impl<L: Send + Sync + 'static> PluginModule for NativeModule<L> {
    fn symbols(&self) -> Vec<String> {
        self.module
            .as_ref()
            .map(|module| module.symbols())
            .unwrap_or_default()
    }

    fn create_entry(&self, symbol: &str, scope: &ModuleScope) -> Option<Arc<dyn PluginEntry>> {
        let inner = self.module.as_ref()?.create_entry(symbol, scope)?;
        Some(Arc::new(NativeEntry {
            inner,
            _library: self.library.clone(),
        }))
    }

    fn get_interface(
        &self,
        capability: &str,
        symbol: &str,
        scope: &ModuleScope,
    ) -> Option<InterfaceInstance> {
        let instance = self.module.as_ref()?.get_interface(capability, symbol, scope)?;
        self.library.track(&instance);
        Some(instance)
    }
}

/// Factory that opens the module file as a shared library
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeModuleLoaderFactory;

impl NativeModuleLoaderFactory {
    pub fn new() -> Self {
        Self
    }

    fn open(plugin_id: &str, path: &Path) -> PluginResult<NativeModule<Library>> {
        if !path.is_file() {
            return Err(PluginRuntimeError::loading(
                plugin_id,
                format!("module file {} does not exist", path.display()),
            ));
        }

        release_retired_libraries();

        // SAFETY: loading a library runs its initialisers; plugin modules are
        // trusted to the extent the permission broker admitted them.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            PluginRuntimeError::loading(plugin_id, format!("failed to open {}: {}", path.display(), e))
        })?;

        let version = {
            // SAFETY: the symbol type matches the one generated by `declare_plugin_module!`.
            let version_fn: Symbol<ApiVersionFn> = unsafe { library.get(API_VERSION_SYMBOL) }
                .map_err(|e| {
                    PluginRuntimeError::ApiIncompatible(format!(
                        "{} does not export plugin_host_api_version: {}",
                        plugin_id, e
                    ))
                })?;
            // SAFETY: see above.
            unsafe { version_fn() }
        };
        if version != HOST_API_VERSION {
            return Err(PluginRuntimeError::ApiIncompatible(format!(
                "{} targets host api {}, host provides {}",
                plugin_id, version, HOST_API_VERSION
            )));
        }

        let raw = {
            // SAFETY: the symbol type matches the one generated by `declare_plugin_module!`.
            let create: Symbol<PluginModuleCreate> = unsafe { library.get(CREATE_SYMBOL) }
                .map_err(|e| {
                    PluginRuntimeError::loading(
                        plugin_id,
                        format!("plugin_module_create not exported: {}", e),
                    )
                })?;
            // SAFETY: see above. The generated constructor catches its own panics.
            unsafe { create() }
        };

        if raw.is_null() {
            return Err(PluginRuntimeError::loading(
                plugin_id,
                "plugin_module_create returned no module",
            ));
        }

        // SAFETY: the pointer came from `Box::into_raw` in the exporting macro
        // and ownership is transferred to us exactly once.
        let module = unsafe { *Box::from_raw(raw) };

        debug!(plugin_id, path = %path.display(), "native module opened");
        Ok(NativeModule::new(module, library, &RETIRED_LIBRARIES))
    }
}

impl ModuleLoaderFactory for NativeModuleLoaderFactory {
    fn create(&self, request: LoaderRequest) -> PluginResult<Arc<dyn ModuleLoader>> {
        let module = Self::open(&request.plugin_id, &request.module_path)?;
        info!(plugin_id = %request.plugin_id, "created native module loader");
        Ok(Arc::new(PluginModuleLoader::new(request.scope(), Arc::new(module))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{HostApplication, PluginFinder, StaticModule};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopFinder;

    impl PluginFinder for NoopFinder {
        fn find_interface(&self, _: &str, _: &str, _: &str) -> Option<InterfaceInstance> {
            None
        }
    }

    struct Echo;

    #[async_trait]
    impl PluginEntry for Echo {
        async fn on_load(&self, _context: &PluginContext) -> PluginResult<()> {
            Ok(())
        }

        async fn on_unload(&self) -> PluginResult<()> {
            Ok(())
        }

        async fn execute(&self, input: Value) -> PluginResult<Value> {
            Ok(input)
        }
    }

    /// Stands in for a mapped library; flags when it is unmapped
    struct FakeLibrary(Arc<AtomicBool>);

    impl Drop for FakeLibrary {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    mod failing_module {
        fn build() -> crate::loader::StaticModule {
            panic!("module constructor failed");
        }

        crate::declare_plugin_module!(build());
    }

    fn request(path: PathBuf) -> LoaderRequest {
        LoaderRequest {
            plugin_id: "native".to_string(),
            module_path: path,
            parent: Arc::new(HostApplication::new("host", "/tmp")),
            finder: Arc::new(NoopFinder),
        }
    }

    fn echo_module() -> Box<dyn PluginModule> {
        Box::new(
            StaticModule::new()
                .with_entry("native::Entry", |_| Arc::new(Echo) as Arc<dyn PluginEntry>)
                .with_interface("Counter", "native::Counter", |_| Arc::new(7u32) as InterfaceInstance),
        )
    }

    #[test]
    fn test_missing_module_file() {
        let result = NativeModuleLoaderFactory::new().create(request(PathBuf::from("/nonexistent/module.so")));
        assert!(matches!(result, Err(PluginRuntimeError::LoadingFailed { .. })));
    }

    #[test]
    fn test_garbage_module_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.so");
        std::fs::write(&path, b"definitely not a shared object").unwrap();

        let result = NativeModuleLoaderFactory::new().create(request(path));
        assert!(matches!(result, Err(PluginRuntimeError::LoadingFailed { .. })));
    }

    #[test]
    fn test_panicking_constructor_returns_null() {
        assert_eq!(failing_module::plugin_host_api_version(), HOST_API_VERSION);
        assert!(failing_module::plugin_module_create().is_null());
    }

    #[tokio::test]
    async fn test_library_outlives_handed_out_objects() {
        static PARK: LibraryPark<FakeLibrary> = LibraryPark::new();
        let unmapped = Arc::new(AtomicBool::new(false));

        let module = NativeModule::new(echo_module(), FakeLibrary(unmapped.clone()), &PARK);
        let loader = PluginModuleLoader::new(request(PathBuf::from("/native")).scope(), Arc::new(module));
        let entry = loader.create_entry("native::Entry").unwrap();
        let counter = loader.get_interface("Counter", "native::Counter").unwrap();

        drop(loader);
        assert_eq!(PARK.sweep(), 1);
        assert!(!unmapped.load(Ordering::SeqCst));

        let out = entry.execute(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out["x"], 1);

        drop(entry);
        assert_eq!(PARK.sweep(), 1);
        assert!(!unmapped.load(Ordering::SeqCst));
        assert_eq!(counter.downcast_ref::<u32>(), Some(&7));

        drop(counter);
        assert_eq!(PARK.sweep(), 0);
        assert!(unmapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unreferenced_library_released_on_sweep() {
        static PARK: LibraryPark<FakeLibrary> = LibraryPark::new();
        let unmapped = Arc::new(AtomicBool::new(false));

        let module = NativeModule::new(echo_module(), FakeLibrary(unmapped.clone()), &PARK);
        assert_eq!(module.symbols(), vec!["native::Counter", "native::Entry"]);
        drop(module);

        assert!(!unmapped.load(Ordering::SeqCst));
        assert_eq!(PARK.sweep(), 0);
        assert!(unmapped.load(Ordering::SeqCst));
    }
}
