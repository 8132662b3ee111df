//! Dynamic plugin runtime
//!
//! Loads independently built, versioned plugin modules into a running host
//! process and keeps them consistent while they come and go:
//! - Plugin lifecycle (launch, unload, chained reload, atomic batch load)
//! - Module index mapping every exported symbol to its owning plugin
//! - Dependency resolution from declared and runtime-observed edges
//! - Capability-based permission checks with dynamic user authorization
//! - Crash attribution to the plugin whose code failed
//! - Transactional install and uninstall with backup and rollback
//!
//! # Permission Model
//!
//! - `NONE` operations are open to everyone
//! - `SELF` operations may only target the calling plugin
//! - `SIGNATURE` and `HOST` require the caller to be signed by the host
//! - Failed soft checks escalate to an [`AuthorizationHandler`]
//! - Unknown callers are denied
//!
//! # Example
//!
//! ```rust,no_run
//! use plugin_host_core::{Caller, FrameworkContext, PluginRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::load(Some("plugin-host.toml".as_ref()))?;
//!     let runtime = PluginRuntime::new(FrameworkContext::builder(config).build()?);
//!
//!     // Loads every enabled plugin once setup succeeds
//!     runtime.initialize(async { Ok(()) }).await?;
//!
//!     let greeter = runtime
//!         .get_plugin_instance(&Caller::Host, "greeter")
//!         .await
//!         .ok_or("greeter is not loaded")?;
//!     let reply = greeter.execute(serde_json::json!({ "name": "world" })).await?;
//!     println!("{reply}");
//!
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod config;
pub mod context;
pub mod crash;
pub mod dependency;
pub mod error;
pub mod index;
pub mod installer;
pub mod lifecycle;
pub mod loader;
pub mod model;
pub mod native;
pub mod permission;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod resources;
pub mod runtime;

pub use authorization::{
    AuthorizationHandler, AuthorizationManager, AuthorizationPrompt, AutoApproveHandler, AutoDenyHandler,
    ChannelAuthorizationHandler,
};
pub use config::RuntimeConfig;
pub use context::{FrameworkContext, FrameworkContextBuilder};
pub use crash::{CrashCallback, CrashFallback, CrashReport, PluginCrashHandler, ProcessRecovery, RecoveryChoice};
pub use dependency::DependencyManager;
pub use error::{ErrorCategory, PluginResult, PluginRuntimeError};
pub use index::ModuleIndex;
pub use installer::{InstallResult, PluginInstaller, PluginManifest, PluginPackage};
pub use lifecycle::{LifecycleManager, PluginState};
pub use loader::{
    HostApplication, InterfaceInstance, ModuleLoader, ModuleLoaderFactory, ModuleScope, PluginContext, PluginEntry,
    PluginModule, StaticModule, StaticModuleLoaderFactory,
};
pub use model::{
    AuthorizationRequest, ComponentDescriptor, FaultKind, InitState, LoadedPlugin, PluginCrashInfo, PluginInfo,
    PluginVersion, RequestKind, ValidationStrategy,
};
pub use native::{release_retired_libraries, NativeModuleLoaderFactory, HOST_API_VERSION};
pub use permission::{PermissionChecker, PermissionLevel, SignatureProvider};
pub use policy::{ApiOperation, Caller, OperationPolicy, PermissionGate, PolicyTable};
pub use registry::{InMemoryPluginRegistry, JsonFilePluginRegistry, PluginRegistry};
pub use runtime::PluginRuntime;
