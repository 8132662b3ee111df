//! Operation policies
//!
//! Every gated runtime method has an entry in a [`PolicyTable`] stating the
//! permission level it requires and whether a failed static check may be
//! escalated. Call sites pass an explicit [`Caller`] and go through
//! [`PermissionGate::authorize`] before doing any work.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::authorization::AuthorizationManager;
use crate::model::AuthorizationRequest;
use crate::permission::PermissionLevel;

/// Who is calling into the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// The embedding host; never gated
    Host,
    /// Code belonging to a plugin
    Plugin(String),
}

impl Caller {
    pub fn plugin(plugin_id: impl Into<String>) -> Self {
        Self::Plugin(plugin_id.into())
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Host => None,
            Self::Plugin(id) => Some(id),
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Plugin(id) => write!(f, "plugin:{}", id),
        }
    }
}

/// Gated runtime surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    LaunchPlugin,
    UnloadPlugin,
    LoadEnabledPlugins,
    SetPluginEnabled,
    GetInterface,
    GetPluginInfo,
    GetPluginInstance,
    GetLoadedPlugins,
    GetInstalledPlugins,
    GetDependentsChain,
    GetDependenciesChain,
    SetValidationStrategy,
    SetAuthorizationHandler,
    SetGlobalCrashCallback,
    SetPluginCrashCallback,
    InstallPlugin,
    UninstallPlugin,
}

impl ApiOperation {
    pub const ALL: [ApiOperation; 17] = [
        Self::LaunchPlugin,
        Self::UnloadPlugin,
        Self::LoadEnabledPlugins,
        Self::SetPluginEnabled,
        Self::GetInterface,
        Self::GetPluginInfo,
        Self::GetPluginInstance,
        Self::GetLoadedPlugins,
        Self::GetInstalledPlugins,
        Self::GetDependentsChain,
        Self::GetDependenciesChain,
        Self::SetValidationStrategy,
        Self::SetAuthorizationHandler,
        Self::SetGlobalCrashCallback,
        Self::SetPluginCrashCallback,
        Self::InstallPlugin,
        Self::UninstallPlugin,
    ];

    /// Method name recorded in authorization requests
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::LaunchPlugin => "launch_plugin",
            Self::UnloadPlugin => "unload_plugin",
            Self::LoadEnabledPlugins => "load_enabled_plugins",
            Self::SetPluginEnabled => "set_plugin_enabled",
            Self::GetInterface => "get_interface",
            Self::GetPluginInfo => "get_plugin_info",
            Self::GetPluginInstance => "get_plugin_instance",
            Self::GetLoadedPlugins => "loaded_plugins",
            Self::GetInstalledPlugins => "all_installed_plugins",
            Self::GetDependentsChain => "get_plugin_dependents_chain",
            Self::GetDependenciesChain => "get_plugin_dependencies_chain",
            Self::SetValidationStrategy => "set_validation_strategy",
            Self::SetAuthorizationHandler => "set_authorization_handler",
            Self::SetGlobalCrashCallback => "set_global_crash_callback",
            Self::SetPluginCrashCallback => "set_plugin_crash_callback",
            Self::InstallPlugin => "install_plugin",
            Self::UninstallPlugin => "uninstall_plugin",
        }
    }
}

impl fmt::Display for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}

/// Requirement attached to one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub level: PermissionLevel,
    /// Deny outright when the static check fails
    pub hard_fail: bool,
}

impl OperationPolicy {
    pub const fn new(level: PermissionLevel, hard_fail: bool) -> Self {
        Self { level, hard_fail }
    }

    pub const fn open() -> Self {
        Self::new(PermissionLevel::None, false)
    }
}

/// Side table from operation to policy
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<ApiOperation, OperationPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use ApiOperation::*;
        use PermissionLevel::{Host, SelfOnly};

        let policies = ApiOperation::ALL
            .into_iter()
            .map(|op| {
                let policy = match op {
                    LaunchPlugin | UnloadPlugin | UninstallPlugin => OperationPolicy::new(SelfOnly, false),
                    LoadEnabledPlugins | SetPluginEnabled | InstallPlugin => OperationPolicy::new(Host, false),
                    SetValidationStrategy | SetAuthorizationHandler | SetGlobalCrashCallback => {
                        OperationPolicy::new(Host, true)
                    }
                    SetPluginCrashCallback => OperationPolicy::new(SelfOnly, true),
                    GetInterface | GetPluginInfo | GetPluginInstance | GetLoadedPlugins
                    | GetInstalledPlugins | GetDependentsChain | GetDependenciesChain => {
                        OperationPolicy::open()
                    }
                };
                (op, policy)
            })
            .collect();

        Self { policies }
    }
}

impl PolicyTable {
    /// Override the policy of one operation
    pub fn with_policy(mut self, operation: ApiOperation, policy: OperationPolicy) -> Self {
        self.policies.insert(operation, policy);
        self
    }

    /// Policy of an operation; unlisted operations require HOST with no escalation
    pub fn policy(&self, operation: ApiOperation) -> OperationPolicy {
        self.policies
            .get(&operation)
            .copied()
            .unwrap_or(OperationPolicy::new(PermissionLevel::Host, true))
    }
}

/// Applies the policy table to a caller
pub struct PermissionGate {
    policies: PolicyTable,
    authorization: Arc<AuthorizationManager>,
}

impl PermissionGate {
    pub fn new(policies: PolicyTable, authorization: Arc<AuthorizationManager>) -> Self {
        Self {
            policies,
            authorization,
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn authorization(&self) -> &Arc<AuthorizationManager> {
        &self.authorization
    }

    /// Check `caller` against the policy of `operation` aimed at `target`.
    ///
    /// The host always passes. Denials are logged here.
    pub async fn authorize(&self, caller: &Caller, operation: ApiOperation, target: Option<&str>) -> bool {
        let Caller::Plugin(plugin_id) = caller else {
            return true;
        };

        let policy = self.policies.policy(operation);
        if policy.level == PermissionLevel::None {
            return true;
        }

        let request = AuthorizationRequest::for_api(plugin_id.as_str(), target, policy.level, operation.method_name());
        let granted = self
            .authorization
            .request_authorization(&request, policy.hard_fail)
            .await;

        if !granted {
            warn!(
                plugin_id = %plugin_id,
                operation = %operation,
                target = ?target,
                level = %policy.level,
                "permission denied"
            );
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::{AutoApproveHandler, AutoDenyHandler};
    use crate::model::PluginInfo;
    use crate::permission::{PermissionChecker, StaticSignatureProvider};
    use crate::registry::{InMemoryPluginRegistry, PluginRegistry};

    fn gate(handler: Arc<dyn crate::authorization::AuthorizationHandler>) -> PermissionGate {
        let registry = InMemoryPluginRegistry::new();
        for id in ["p1", "p2"] {
            registry
                .add_plugin(PluginInfo::new(id, id, format!("/plugins/{id}"), "entry"))
                .unwrap();
        }
        let checker = PermissionChecker::new(Arc::new(registry), Arc::new(StaticSignatureProvider::new(["aa"])));
        let manager = AuthorizationManager::new(Arc::new(checker), handler);
        PermissionGate::new(PolicyTable::default(), Arc::new(manager))
    }

    #[test]
    fn test_default_policies() {
        let table = PolicyTable::default();
        assert_eq!(
            table.policy(ApiOperation::SetValidationStrategy),
            OperationPolicy::new(PermissionLevel::Host, true)
        );
        assert_eq!(
            table.policy(ApiOperation::LaunchPlugin),
            OperationPolicy::new(PermissionLevel::SelfOnly, false)
        );
        assert_eq!(table.policy(ApiOperation::GetPluginInfo).level, PermissionLevel::None);
    }

    #[tokio::test]
    async fn test_host_caller_always_passes() {
        let gate = gate(Arc::new(AutoDenyHandler));
        for op in ApiOperation::ALL {
            assert!(gate.authorize(&Caller::Host, op, None).await, "{op}");
        }
    }

    #[tokio::test]
    async fn test_plugin_caller_self_and_hard_fail() {
        let gate = gate(Arc::new(AutoApproveHandler));
        let p1 = Caller::plugin("p1");

        assert!(gate.authorize(&p1, ApiOperation::SetPluginCrashCallback, Some("p1")).await);
        assert!(!gate.authorize(&p1, ApiOperation::SetPluginCrashCallback, Some("p2")).await);
        assert!(!gate.authorize(&p1, ApiOperation::SetValidationStrategy, None).await);

        // Not hard-fail, so the approving handler grants it.
        assert!(gate.authorize(&p1, ApiOperation::UnloadPlugin, Some("p2")).await);
        assert!(gate.authorize(&Caller::plugin("ghost"), ApiOperation::GetPluginInfo, None).await);
    }
}
