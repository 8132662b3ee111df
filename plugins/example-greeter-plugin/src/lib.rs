//! Example Greeter Plugin - native plugin built against the host module ABI
//!
//! This plugin demonstrates how to:
//! - Export a module with `declare_plugin_module!`
//! - Provide an entry point the host instantiates on launch
//! - Offer an interface other plugins can look up by symbol
//!
//! Build with `cargo build --release -p example-greeter-plugin`, then install
//! with `plugin-host install plugins/example-greeter-plugin/plugin.json`.

use async_trait::async_trait;
use plugin_host_core::loader::{InterfaceInstance, ModuleScope, PluginContext, PluginEntry, PluginModule};
use plugin_host_core::{declare_plugin_module, PluginResult, PluginRuntimeError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

// Symbols are crate paths so backtrace frames resolve to this plugin.
pub const ENTRY_SYMBOL: &str = "example_greeter_plugin::GreeterEntry";
pub const GREETER_SYMBOL: &str = "example_greeter_plugin::Greeting";
pub const GREETER_CAPABILITY: &str = "Greeter";

/// Interface shared with other plugins under [`GREETER_SYMBOL`]
#[derive(Debug, Clone)]
pub struct Greeting {
    pub salutation: String,
}

impl Greeting {
    pub fn greet(&self, name: &str) -> String {
        format!("{}, {}!", self.salutation, name)
    }
}

#[derive(Debug, Deserialize)]
struct GreetRequest {
    #[serde(default = "default_name")]
    name: String,
}

fn default_name() -> String {
    "world".to_string()
}

/// Entry point instantiated by the host
pub struct GreeterEntry {
    greeting: Greeting,
    calls: AtomicU64,
}

#[async_trait]
impl PluginEntry for GreeterEntry {
    async fn on_load(&self, context: &PluginContext) -> PluginResult<()> {
        info!(
            plugin_id = %context.plugin_info.id,
            host = %context.host.name(),
            "greeter loaded"
        );
        Ok(())
    }

    async fn on_unload(&self) -> PluginResult<()> {
        info!(calls = self.calls.load(Ordering::Relaxed), "greeter unloaded");
        Ok(())
    }

    async fn execute(&self, input: Value) -> PluginResult<Value> {
        let request: GreetRequest = if input.is_null() {
            GreetRequest { name: default_name() }
        } else {
            serde_json::from_value(input)
                .map_err(|e| PluginRuntimeError::ExecutionFailed(format!("invalid greet request: {e}")))?
        };

        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(json!({
            "message": self.greeting.greet(&request.name),
            "calls": calls,
        }))
    }
}

/// Module exported to the host
#[derive(Default)]
pub struct GreeterModule;

impl PluginModule for GreeterModule {
    fn symbols(&self) -> Vec<String> {
        vec![ENTRY_SYMBOL.to_string(), GREETER_SYMBOL.to_string()]
    }

    fn create_entry(&self, symbol: &str, _scope: &ModuleScope) -> Option<Arc<dyn PluginEntry>> {
        (symbol == ENTRY_SYMBOL).then(|| {
            Arc::new(GreeterEntry {
                greeting: greeting(),
                calls: AtomicU64::new(0),
            }) as Arc<dyn PluginEntry>
        })
    }

    fn get_interface(&self, capability: &str, symbol: &str, _scope: &ModuleScope) -> Option<InterfaceInstance> {
        (capability == GREETER_CAPABILITY && symbol == GREETER_SYMBOL)
            .then(|| Arc::new(greeting()) as InterfaceInstance)
    }
}

fn greeting() -> Greeting {
    Greeting {
        salutation: "Hello".to_string(),
    }
}

declare_plugin_module!(GreeterModule);
