//! Component proxy boundary
//!
//! Static receivers and providers declared by a plugin are registered with
//! the host's proxy layer while the plugin is loaded. The dispatch wire
//! format belongs to the host; this module only tracks registrations.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{PluginResult, PluginRuntimeError};
use crate::model::ComponentDescriptor;

pub trait ComponentProxy: Send + Sync {
    fn register_static_receivers(
        &self,
        plugin_id: &str,
        receivers: &[ComponentDescriptor],
    ) -> PluginResult<()>;

    fn register_providers(&self, plugin_id: &str, providers: &[ComponentDescriptor]) -> PluginResult<()>;

    /// Remove every receiver and provider of `plugin_id`; missing ones are ignored
    fn unregister_plugin(&self, plugin_id: &str);
}

/// Owning plugin id and the provider registered for an authority
type ProviderClaim = (String, ComponentDescriptor);

/// In-memory registration table
#[derive(Debug, Default)]
pub struct ComponentProxyTable {
    receivers: DashMap<String, Vec<ComponentDescriptor>>,
    /// authority -> (plugin id, provider)
    providers: DashMap<String, ProviderClaim>,
}

impl ComponentProxyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receivers_of(&self, plugin_id: &str) -> Vec<ComponentDescriptor> {
        self.receivers
            .get(plugin_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Plugins whose registered receivers listen for `action`
    pub fn receivers_for_action(&self, action: &str) -> Vec<(String, String)> {
        let mut matches = Vec::new();
        for entry in self.receivers.iter() {
            for receiver in entry.value() {
                if receiver.actions.iter().any(|a| a == action) {
                    matches.push((entry.key().clone(), receiver.name.clone()));
                }
            }
        }
        matches.sort();
        matches
    }

    pub fn provider_owner(&self, authority: &str) -> Option<String> {
        self.providers.get(authority).map(|entry| entry.value().0.clone())
    }

    fn rollback_providers(&self, plugin_id: &str, claimed: Vec<(String, Option<ProviderClaim>)>) {
        for (authority, previous) in claimed.into_iter().rev() {
            match previous {
                Some(previous) => {
                    self.providers.insert(authority, previous);
                }
                None => {
                    self.providers.remove_if(&authority, |_, (owner, _)| owner == plugin_id);
                }
            }
        }
    }
}

impl ComponentProxy for ComponentProxyTable {
    fn register_static_receivers(
        &self,
        plugin_id: &str,
        receivers: &[ComponentDescriptor],
    ) -> PluginResult<()> {
        let enabled: Vec<ComponentDescriptor> =
            receivers.iter().filter(|r| r.enabled).cloned().collect();
        if enabled.is_empty() {
            return Ok(());
        }
        debug!(plugin_id, count = enabled.len(), "registered static receivers");
        self.receivers.insert(plugin_id.to_string(), enabled);
        Ok(())
    }

    fn register_providers(&self, plugin_id: &str, providers: &[ComponentDescriptor]) -> PluginResult<()> {
        // Each authority is claimed atomically; a conflict undoes this call's claims.
        let mut claimed: Vec<(String, Option<ProviderClaim>)> = Vec::new();
        for provider in providers.iter().filter(|p| p.enabled) {
            for authority in &provider.actions {
                let claim = (plugin_id.to_string(), provider.clone());
                let conflict = match self.providers.entry(authority.clone()) {
                    Entry::Occupied(existing) if existing.get().0 != plugin_id => {
                        Some(existing.get().0.clone())
                    }
                    Entry::Occupied(mut existing) => {
                        let previous = existing.insert(claim);
                        claimed.push((authority.clone(), Some(previous)));
                        None
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(claim);
                        claimed.push((authority.clone(), None));
                        None
                    }
                };

                if let Some(owner) = conflict {
                    self.rollback_providers(plugin_id, claimed);
                    return Err(PluginRuntimeError::InvalidState(format!(
                        "provider authority '{}' already registered by {}",
                        authority, owner
                    )));
                }
            }
        }

        debug!(plugin_id, count = claimed.len(), "registered providers");
        Ok(())
    }

    fn unregister_plugin(&self, plugin_id: &str) {
        self.receivers.remove(plugin_id);
        self.providers.retain(|_, (owner, _)| owner != plugin_id);
    }
}
