//! Crash attribution
//!
//! Uncaught failures are turned into a [`CrashReport`], attributed to a
//! culprit plugin through the module index, classified into a
//! [`FaultKind`] and dispatched: the culprit's own callback first, then the
//! global callback, then the [`CrashFallback`]. Failures that cannot be
//! attributed to a plugin go to the previously installed panic hook
//! unchanged.
//!
//! Frame attribution is best-effort: symbol names come from
//! `std::backtrace` and may be missing when frames are inlined or debug
//! info is stripped. An explicit caller recorded on the report always wins.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::error::Error;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::FrameworkContext;
use crate::error::{PluginResult, PluginRuntimeError};
use crate::index::ModuleIndex;
use crate::model::{FaultKind, PluginCrashInfo};
use crate::registry::PluginRegistry;

/// Exit code used when the process is terminated after a plugin crash
pub const CRASH_EXIT_CODE: i32 = 10;

/// Typed fault carried by one link of a failure chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashFault {
    DependencyMissing { culprit: String, symbol: String },
    StaleInstance,
    ResourceNotFound,
    ApiIncompatible,
}

impl CrashFault {
    fn from_error(err: &PluginRuntimeError) -> Option<Self> {
        match err {
            PluginRuntimeError::DependencyMissing { culprit, symbol } => Some(Self::DependencyMissing {
                culprit: culprit.clone(),
                symbol: symbol.clone(),
            }),
            PluginRuntimeError::StaleInstance(_) => Some(Self::StaleInstance),
            PluginRuntimeError::ResourceNotFound(_) => Some(Self::ResourceNotFound),
            PluginRuntimeError::ApiIncompatible(_) => Some(Self::ApiIncompatible),
            _ => None,
        }
    }
}

/// One link of a failure chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashCause {
    pub message: String,
    /// Qualified symbol paths, innermost first
    pub frames: Vec<String>,
    pub fault: Option<CrashFault>,
}

/// Everything crash attribution knows about a failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashReport {
    /// Plugin recorded by the call boundary, if any
    pub caller: Option<String>,
    /// Outermost failure first
    pub chain: Vec<CrashCause>,
}

impl CrashReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            caller: None,
            chain: vec![CrashCause {
                message: message.into(),
                ..CrashCause::default()
            }],
        }
    }

    /// Walk an error and its sources
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut current: Option<&(dyn Error + 'static)> = Some(err);
        while let Some(cause) = current {
            chain.push(CrashCause {
                message: cause.to_string(),
                frames: Vec::new(),
                fault: cause
                    .downcast_ref::<PluginRuntimeError>()
                    .and_then(CrashFault::from_error),
            });
            current = cause.source();
        }
        Self { caller: None, chain }
    }

    /// Build a report from inside a panic hook
    pub fn from_panic(info: &PanicHookInfo<'_>, backtrace: &Backtrace) -> Self {
        let payload = info.payload();
        let (message, fault) = if let Some(err) = payload.downcast_ref::<PluginRuntimeError>() {
            (err.to_string(), CrashFault::from_error(err))
        } else if let Some(s) = payload.downcast_ref::<&'static str>() {
            ((*s).to_string(), None)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            (s.clone(), None)
        } else {
            ("unknown panic payload".to_string(), None)
        };

        let message = match info.location() {
            Some(location) => format!("{} at {}:{}", message, location.file(), location.line()),
            None => message,
        };

        Self {
            caller: None,
            chain: vec![CrashCause {
                message,
                frames: parse_backtrace(&backtrace.to_string()),
                fault,
            }],
        }
    }

    pub fn with_caller(mut self, plugin_id: impl Into<String>) -> Self {
        self.caller = Some(plugin_id.into());
        self
    }

    /// Attach frames to the outermost cause
    pub fn with_frames<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.chain.is_empty() {
            self.chain.push(CrashCause::default());
        }
        if let Some(first) = self.chain.first_mut() {
            first.frames.extend(frames.into_iter().map(Into::into));
        }
        self
    }

    pub fn message(&self) -> &str {
        self.chain.first().map(|c| c.message.as_str()).unwrap_or_default()
    }

    fn find_fault(&self, wanted: impl Fn(&CrashFault) -> bool) -> Option<&CrashFault> {
        self.chain
            .iter()
            .filter_map(|cause| cause.fault.as_ref())
            .find(|fault| wanted(fault))
    }

    /// Most specific fault kind anywhere in the chain
    pub fn classify(&self) -> FaultKind {
        if self.find_fault(|f| matches!(f, CrashFault::DependencyMissing { .. })).is_some() {
            FaultKind::DependencyMissing
        } else if self.find_fault(|f| *f == CrashFault::StaleInstance).is_some() {
            FaultKind::StaleInstance
        } else if self.find_fault(|f| *f == CrashFault::ResourceNotFound).is_some() {
            FaultKind::ResourceNotFound
        } else if self.find_fault(|f| *f == CrashFault::ApiIncompatible).is_some() {
            FaultKind::ApiIncompatible
        } else {
            FaultKind::Other
        }
    }

    fn dependency_culprit(&self) -> Option<&str> {
        match self.find_fault(|f| matches!(f, CrashFault::DependencyMissing { .. })) {
            Some(CrashFault::DependencyMissing { culprit, .. }) => Some(culprit.as_str()),
            _ => None,
        }
    }
}

/// Extract qualified symbol paths from a rendered `std::backtrace::Backtrace`.
///
/// Frame lines look like `  12: crate::Type::method::h0123456789abcdef`;
/// `at file:line` lines are skipped and trait impls such as
/// `<crate::Type as crate::Trait>::method` resolve to `crate::Type`.
pub fn parse_backtrace(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim().split_once(": ")?;
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            normalize_symbol(symbol.trim())
        })
        .collect()
}

fn normalize_symbol(symbol: &str) -> Option<String> {
    let symbol = match symbol.rsplit_once("::h") {
        Some((path, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => path,
        _ => symbol,
    };

    let symbol = match symbol.strip_prefix('<') {
        Some(inner) => {
            let end = inner
                .find(" as ")
                .or_else(|| inner.find('>'))
                .unwrap_or(inner.len());
            inner.get(..end).unwrap_or(inner)
        }
        None => symbol,
    };

    let symbol = symbol.trim();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_string())
    }
}

/// Attributes a report to a plugin
pub trait CulpritResolver: Send + Sync {
    fn resolve(&self, report: &CrashReport, index: &ModuleIndex) -> Option<String>;
}

/// Explicit caller first, then the first indexed frame along the chain
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexFrameResolver;

impl CulpritResolver for IndexFrameResolver {
    fn resolve(&self, report: &CrashReport, index: &ModuleIndex) -> Option<String> {
        if let Some(caller) = &report.caller {
            return Some(caller.clone());
        }
        report
            .chain
            .iter()
            .flat_map(|cause| cause.frames.iter())
            .find_map(|frame| index.resolve_owner(frame))
    }
}

/// Crash callback; each method returns whether it handled the crash
pub trait CrashCallback: Send + Sync {
    fn on_dependency_missing(&self, _info: &PluginCrashInfo) -> bool {
        false
    }

    fn on_stale_instance(&self, _info: &PluginCrashInfo) -> bool {
        false
    }

    fn on_resource_not_found(&self, _info: &PluginCrashInfo) -> bool {
        false
    }

    fn on_api_incompatible(&self, _info: &PluginCrashInfo) -> bool {
        false
    }

    fn on_other_plugin_fault(&self, _info: &PluginCrashInfo) -> bool {
        false
    }
}

fn dispatch(callback: &dyn CrashCallback, info: &PluginCrashInfo) -> bool {
    match info.kind {
        FaultKind::DependencyMissing => callback.on_dependency_missing(info),
        FaultKind::StaleInstance => callback.on_stale_instance(info),
        FaultKind::ResourceNotFound => callback.on_resource_not_found(info),
        FaultKind::ApiIncompatible => callback.on_api_incompatible(info),
        FaultKind::Other => callback.on_other_plugin_fault(info),
    }
}

/// Registered crash callbacks
#[derive(Default)]
pub struct CrashCallbacks {
    plugins: DashMap<String, Arc<dyn CrashCallback>>,
    global: RwLock<Option<Arc<dyn CrashCallback>>>,
}

impl CrashCallbacks {
    pub fn set_plugin_callback(&self, plugin_id: &str, callback: Option<Arc<dyn CrashCallback>>) {
        match callback {
            Some(callback) => {
                self.plugins.insert(plugin_id.to_string(), callback);
                debug!(plugin_id, "crash callback registered");
            }
            None => {
                if self.plugins.remove(plugin_id).is_some() {
                    debug!(plugin_id, "crash callback removed");
                }
            }
        }
    }

    pub fn set_global_callback(&self, callback: Option<Arc<dyn CrashCallback>>) {
        *self.global.write() = callback;
        info!("global crash callback updated");
    }

    pub fn plugin_callback(&self, plugin_id: &str) -> Option<Arc<dyn CrashCallback>> {
        self.plugins.get(plugin_id).map(|entry| entry.value().clone())
    }

    pub fn global_callback(&self) -> Option<Arc<dyn CrashCallback>> {
        self.global.read().clone()
    }
}

/// Last resort when no callback handled a plugin crash
pub trait CrashFallback: Send + Sync {
    fn on_unhandled(&self, info: &PluginCrashInfo);
}

/// What the recovery surface offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Terminate,
    DisableAndRestart,
}

/// Asks how to recover; a host with a UI shows a dialog here
pub trait RecoverySurface: Send + Sync {
    fn choose(&self, info: &PluginCrashInfo) -> RecoveryChoice;
}

/// Surface that always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedRecovery(pub RecoveryChoice);

impl RecoverySurface for FixedRecovery {
    fn choose(&self, _info: &PluginCrashInfo) -> RecoveryChoice {
        self.0
    }
}

/// Terminates the process, optionally disabling the culprit and relaunching
pub struct ProcessRecovery {
    registry: Arc<dyn PluginRegistry>,
    surface: Arc<dyn RecoverySurface>,
}

impl ProcessRecovery {
    pub fn new(registry: Arc<dyn PluginRegistry>, surface: Arc<dyn RecoverySurface>) -> Self {
        Self { registry, surface }
    }

    /// Mark the culprit disabled and commit the registry
    pub fn disable_culprit(&self, plugin_id: &str) -> PluginResult<()> {
        let mut info = self
            .registry
            .get_plugin_by_id(plugin_id)?
            .ok_or_else(|| PluginRuntimeError::PluginNotFound(plugin_id.to_string()))?;
        info.enabled = false;
        self.registry.update_plugin(info)?;
        self.registry.flush_to_disk()
    }

    /// Start a fresh copy of the current executable with the same arguments
    pub fn relaunch() -> std::io::Result<()> {
        let exe = std::env::current_exe()?;
        Command::new(exe).args(std::env::args_os().skip(1)).spawn()?;
        Ok(())
    }
}

impl CrashFallback for ProcessRecovery {
    fn on_unhandled(&self, info: &PluginCrashInfo) {
        error!(
            plugin_id = %info.culprit,
            kind = %info.kind,
            message = %info.message,
            "{}",
            info.default_message
        );

        if self.surface.choose(info) == RecoveryChoice::DisableAndRestart {
            if let Err(e) = self.disable_culprit(&info.culprit) {
                error!(plugin_id = %info.culprit, error = %e, "failed to disable crashing plugin");
            } else if let Err(e) = Self::relaunch() {
                error!(error = %e, "failed to relaunch process");
            } else {
                info!(plugin_id = %info.culprit, "plugin disabled, process relaunched");
            }
        }

        std::process::exit(CRASH_EXIT_CODE);
    }
}

tokio::task_local! {
    static MANAGED_CALL: ();
}

thread_local! {
    static MANAGED_BLOCKING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current code runs inside a lifecycle call that contains its
/// own failures
pub fn is_managed_call() -> bool {
    MANAGED_CALL.try_with(|_| ()).is_ok() || MANAGED_BLOCKING.with(Cell::get)
}

/// Run a plugin hook whose panics the lifecycle manager handles itself
pub async fn managed<F: Future>(future: F) -> F::Output {
    MANAGED_CALL.scope((), future).await
}

/// Blocking counterpart of [`managed`]
pub fn managed_blocking<R>(work: impl FnOnce() -> R) -> R {
    struct Reset(bool);

    impl Drop for Reset {
        fn drop(&mut self) {
            MANAGED_BLOCKING.with(|flag| flag.set(self.0));
        }
    }

    let _reset = Reset(MANAGED_BLOCKING.with(|flag| flag.replace(true)));
    work()
}

static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Attributes and dispatches crashes
pub struct PluginCrashHandler {
    context: Arc<FrameworkContext>,
    resolver: Arc<dyn CulpritResolver>,
    fallback: Arc<dyn CrashFallback>,
}

impl PluginCrashHandler {
    pub fn new(context: Arc<FrameworkContext>, fallback: Arc<dyn CrashFallback>) -> Self {
        Self {
            context,
            resolver: Arc::new(IndexFrameResolver),
            fallback,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CulpritResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Culprit of a report, if it is plugin related
    pub fn culprit(&self, report: &CrashReport) -> Option<String> {
        report
            .dependency_culprit()
            .map(str::to_string)
            .or_else(|| self.resolver.resolve(report, self.context.index()))
    }

    /// Handle a report. Returns false when the failure is not plugin related.
    pub fn handle(&self, report: &CrashReport) -> bool {
        let Some(culprit) = self.culprit(report) else {
            debug!("failure not attributed to any plugin");
            return false;
        };

        let info = PluginCrashInfo::new(report.classify(), culprit, report.message());
        warn!(plugin_id = %info.culprit, kind = %info.kind, "plugin crash: {}", info.message);

        let callbacks = self.context.crash_callbacks();
        if let Some(callback) = callbacks.plugin_callback(&info.culprit) {
            if dispatch(callback.as_ref(), &info) {
                return true;
            }
        }
        if let Some(callback) = callbacks.global_callback() {
            if dispatch(callback.as_ref(), &info) {
                return true;
            }
        }

        self.fallback.on_unhandled(&info);
        true
    }

    /// Install as the process panic hook, chaining to the previous one.
    ///
    /// Returns false if a handler is already installed.
    pub fn install(self: Arc<Self>) -> bool {
        if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
            warn!("plugin crash handler already installed");
            return false;
        }

        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |hook_info| {
            if is_managed_call() {
                previous(hook_info);
                return;
            }

            let backtrace = Backtrace::force_capture();
            let report = CrashReport::from_panic(hook_info, &backtrace);
            let handled = panic::catch_unwind(AssertUnwindSafe(|| self.handle(&report))).unwrap_or(false);
            if !handled {
                previous(hook_info);
            }
        }));

        info!("plugin crash handler installed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::loader::StaticModuleLoaderFactory;
    use crate::model::PluginInfo;
    use crate::registry::InMemoryPluginRegistry;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingFallback(Mutex<Vec<PluginCrashInfo>>);

    impl CrashFallback for RecordingFallback {
        fn on_unhandled(&self, info: &PluginCrashInfo) {
            self.0.lock().push(info.clone());
        }
    }

    struct HandlesStale;

    impl CrashCallback for HandlesStale {
        fn on_stale_instance(&self, _info: &PluginCrashInfo) -> bool {
            true
        }
    }

    fn handler() -> (PluginCrashHandler, Arc<RecordingFallback>, Arc<FrameworkContext>) {
        let context = FrameworkContext::builder(RuntimeConfig::default())
            .registry(Arc::new(InMemoryPluginRegistry::new()))
            .loader_factory(Arc::new(StaticModuleLoaderFactory::new()))
            .build()
            .unwrap();
        context.index().register("greeter", ["greeter::Greeter"]).unwrap();
        let fallback = Arc::new(RecordingFallback::default());
        (
            PluginCrashHandler::new(context.clone(), fallback.clone()),
            fallback,
            context,
        )
    }

    #[test]
    fn test_parse_backtrace() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
   1: <greeter::Greeter as plugin_host_core::loader::PluginEntry>::execute::h0123456789abcdef
             at ./src/lib.rs:10:5
   2: greeter::Greeter::render::hfedcba9876543210
   3: main";

        assert_eq!(
            parse_backtrace(rendered),
            vec![
                "std::backtrace::Backtrace::force_capture",
                "greeter::Greeter",
                "greeter::Greeter::render",
                "main",
            ]
        );
    }

    #[test]
    fn test_error_chain_classification() {
        #[derive(Debug)]
        struct Wrapper(PluginRuntimeError);

        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "render failed")
            }
        }

        impl Error for Wrapper {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(PluginRuntimeError::StaleInstance("greeter::Greeter".to_string()));
        let report = CrashReport::from_error(&err);

        assert_eq!(report.chain.len(), 2);
        assert_eq!(report.classify(), FaultKind::StaleInstance);
        assert_eq!(report.message(), "render failed");
    }

    #[test]
    fn test_unattributed_report_is_not_handled() {
        let (handler, fallback, _context) = handler();
        let report = CrashReport::new("boom").with_frames(["std::rt::lang_start"]);

        assert!(!handler.handle(&report));
        assert!(fallback.0.lock().is_empty());
    }

    #[test]
    fn test_dispatch_order() {
        let (handler, fallback, context) = handler();
        let stale = CrashReport::from_error(&PluginRuntimeError::StaleInstance("x".to_string()))
            .with_frames(["greeter::Greeter::render"]);

        // No callbacks: falls through to the fallback.
        assert!(handler.handle(&stale));
        assert_eq!(fallback.0.lock().len(), 1);
        assert_eq!(fallback.0.lock()[0].culprit, "greeter");

        // Global callback handles stale instances.
        context.crash_callbacks().set_global_callback(Some(Arc::new(HandlesStale)));
        assert!(handler.handle(&stale));
        assert_eq!(fallback.0.lock().len(), 1);

        // Other faults are not handled by it.
        let other = CrashReport::new("panic").with_caller("greeter");
        assert!(handler.handle(&other));
        assert_eq!(fallback.0.lock().len(), 2);
        assert_eq!(fallback.0.lock()[1].kind, FaultKind::Other);
    }

    #[test]
    fn test_dependency_fault_names_its_own_culprit() {
        let (handler, fallback, _context) = handler();
        let report = CrashReport::from_error(&PluginRuntimeError::DependencyMissing {
            culprit: "weather".to_string(),
            symbol: "geo::Locator".to_string(),
        });

        assert!(handler.handle(&report));
        let recorded = fallback.0.lock();
        assert_eq!(recorded[0].culprit, "weather");
        assert_eq!(recorded[0].kind, FaultKind::DependencyMissing);
    }

    #[test]
    fn test_disable_culprit() {
        let registry = Arc::new(InMemoryPluginRegistry::with_plugins([PluginInfo::new(
            "greeter", "Greeter", "/p", "e",
        )]));
        let recovery = ProcessRecovery::new(registry.clone(), Arc::new(FixedRecovery(RecoveryChoice::Terminate)));

        recovery.disable_culprit("greeter").unwrap();
        assert!(!registry.get_plugin_by_id("greeter").unwrap().unwrap().enabled);
        assert!(recovery.disable_culprit("missing").is_err());
    }

    #[test]
    fn test_managed_blocking_flag_restores() {
        assert!(!is_managed_call());
        managed_blocking(|| assert!(is_managed_call()));
        assert!(!is_managed_call());
    }

    #[tokio::test]
    async fn test_managed_future_flag() {
        assert!(!is_managed_call());
        managed(async { assert!(is_managed_call()) }).await;
    }
}
