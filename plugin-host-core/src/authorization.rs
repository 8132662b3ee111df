//! Dynamic authorization
//!
//! When a static permission check fails on an operation that is not
//! hard-fail, the decision is handed to an [`AuthorizationHandler`] which may
//! suspend the caller until a person or policy service answers.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{AuthorizationRequest, RequestKind};
use crate::permission::PermissionChecker;

/// Resolves authorization requests the static check could not grant
#[async_trait]
pub trait AuthorizationHandler: Send + Sync {
    /// Decide a request; may wait indefinitely
    async fn on_authorization_request(&self, request: AuthorizationRequest) -> bool;
}

/// Grants every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApproveHandler;

#[async_trait]
impl AuthorizationHandler for AutoApproveHandler {
    async fn on_authorization_request(&self, request: AuthorizationRequest) -> bool {
        debug!(plugin_id = %request.calling_plugin_id, kind = ?request.kind, "auto-approved");
        true
    }
}

/// Denies every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDenyHandler;

#[async_trait]
impl AuthorizationHandler for AutoDenyHandler {
    async fn on_authorization_request(&self, request: AuthorizationRequest) -> bool {
        debug!(plugin_id = %request.calling_plugin_id, kind = ?request.kind, "auto-denied");
        false
    }
}

/// A request published to whoever answers prompts
#[derive(Debug, Clone)]
pub struct AuthorizationPrompt {
    /// Correlation id to pass back to [`ChannelAuthorizationHandler::resolve`]
    pub id: Uuid,
    pub request: AuthorizationRequest,
}

type PendingTable = Arc<DashMap<Uuid, oneshot::Sender<bool>>>;

/// Handler that publishes prompts on a channel and waits for `resolve`.
///
/// Cloning shares the pending table, so one clone can be installed in the
/// runtime while another answers prompts.
#[derive(Clone)]
pub struct ChannelAuthorizationHandler {
    pending: PendingTable,
    prompts: mpsc::UnboundedSender<AuthorizationPrompt>,
}

impl ChannelAuthorizationHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuthorizationPrompt>) {
        let (prompts, receiver) = mpsc::unbounded_channel();
        (
            Self {
                pending: Arc::new(DashMap::new()),
                prompts,
            },
            receiver,
        )
    }

    /// Deliver a decision. Returns false if the request is no longer pending.
    pub fn resolve(&self, id: Uuid, granted: bool) -> bool {
        match self.pending.remove(&id) {
            Some((_, sender)) => sender.send(granted).is_ok(),
            None => {
                debug!(%id, "authorization already resolved or abandoned");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: Uuid) -> bool {
        self.pending.contains_key(&id)
    }
}

/// Retracts the pending entry when the waiting future goes away
struct PendingGuard {
    pending: PendingTable,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.remove(&self.id).is_some() {
            debug!(id = %self.id, "authorization request retracted");
        }
    }
}

#[async_trait]
impl AuthorizationHandler for ChannelAuthorizationHandler {
    async fn on_authorization_request(&self, request: AuthorizationRequest) -> bool {
        let id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        if self.prompts.send(AuthorizationPrompt { id, request }).is_err() {
            warn!(%id, "no one is listening for authorization prompts, denying");
            return false;
        }

        receiver.await.unwrap_or(false)
    }
}

/// Static check first, then escalation
pub struct AuthorizationManager {
    checker: Arc<PermissionChecker>,
    handler: RwLock<Arc<dyn AuthorizationHandler>>,
    default_handler: Arc<dyn AuthorizationHandler>,
}

impl AuthorizationManager {
    pub fn new(checker: Arc<PermissionChecker>, default_handler: Arc<dyn AuthorizationHandler>) -> Self {
        Self {
            checker,
            handler: RwLock::new(default_handler.clone()),
            default_handler,
        }
    }

    pub fn checker(&self) -> &Arc<PermissionChecker> {
        &self.checker
    }

    fn static_check(&self, request: &AuthorizationRequest) -> bool {
        match request.kind {
            RequestKind::ApiPermission => match request.required_level() {
                Some(level) => self.checker.check_api_permission(
                    Some(&request.calling_plugin_id),
                    level,
                    request.target_plugin_id(),
                ),
                None => {
                    warn!(plugin_id = %request.calling_plugin_id, "api request without a permission level");
                    false
                }
            },
            RequestKind::InstallPermission => self.checker.check_install_permission(
                request
                    .detail(AuthorizationRequest::KEY_SIGNATURE_HASH)
                    .unwrap_or_default(),
            ),
        }
    }

    /// Authorize a request.
    ///
    /// Returns immediately when the static check passes or when `hard_fail`
    /// forbids escalation; otherwise waits for the installed handler.
    pub async fn request_authorization(&self, request: &AuthorizationRequest, hard_fail: bool) -> bool {
        if self.static_check(request) {
            debug!(plugin_id = %request.calling_plugin_id, kind = ?request.kind, "static check passed");
            return true;
        }

        if hard_fail {
            warn!(plugin_id = %request.calling_plugin_id, kind = ?request.kind, "authorization denied (hard fail)");
            return false;
        }

        info!(plugin_id = %request.calling_plugin_id, kind = ?request.kind, "static check failed, escalating");
        let handler = self.handler.read().clone();
        handler.on_authorization_request(request.clone()).await
    }

    /// Replace the handler; `None` restores the default
    pub fn set_handler(&self, handler: Option<Arc<dyn AuthorizationHandler>>) {
        *self.handler.write() = handler.unwrap_or_else(|| self.default_handler.clone());
        info!("authorization handler updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PluginInfo;
    use crate::permission::{PermissionLevel, StaticSignatureProvider};
    use crate::registry::{InMemoryPluginRegistry, PluginRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl AuthorizationHandler for CountingHandler {
        async fn on_authorization_request(&self, _request: AuthorizationRequest) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn manager(handler: Arc<dyn AuthorizationHandler>) -> AuthorizationManager {
        let registry = InMemoryPluginRegistry::new();
        registry
            .add_plugin(PluginInfo::new("p1", "P1", "/plugins/p1/module", "entry"))
            .unwrap();
        let checker = PermissionChecker::new(Arc::new(registry), Arc::new(StaticSignatureProvider::new(["aa"])));
        AuthorizationManager::new(Arc::new(checker), handler)
    }

    #[tokio::test]
    async fn test_static_pass_skips_handler() {
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let manager = manager(handler.clone());

        let request = AuthorizationRequest::for_api("p1", Some("p1"), PermissionLevel::SelfOnly, "unload_plugin");
        assert!(manager.request_authorization(&request, false).await);
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hard_fail_never_escalates() {
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let manager = manager(handler.clone());

        let request = AuthorizationRequest::for_api("p1", None, PermissionLevel::Host, "set_validation_strategy");
        assert!(!manager.request_authorization(&request, true).await);
        assert!(manager.request_authorization(&request, false).await);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_request_uses_host_digests() {
        let manager = manager(Arc::new(AutoDenyHandler));

        let trusted = AuthorizationRequest::for_install("p9", "aa", "1.0.0", "", "P9");
        let unknown = AuthorizationRequest::for_install("p9", "bb", "1.0.0", "", "P9");
        assert!(manager.request_authorization(&trusted, false).await);
        assert!(!manager.request_authorization(&unknown, false).await);

        manager.set_handler(Some(Arc::new(AutoApproveHandler)));
        assert!(manager.request_authorization(&unknown, false).await);
        manager.set_handler(None);
        assert!(!manager.request_authorization(&unknown, false).await);
    }

    #[tokio::test]
    async fn test_channel_handler_resolves() {
        let (handler, mut prompts) = ChannelAuthorizationHandler::new();
        let answering = handler.clone();

        let waiter = tokio::spawn(async move {
            handler
                .on_authorization_request(AuthorizationRequest::for_install("p1", "x", "1", "", "P1"))
                .await
        });

        let prompt = prompts.recv().await.unwrap();
        assert!(answering.is_pending(prompt.id));
        assert!(answering.resolve(prompt.id, true));
        assert!(waiter.await.unwrap());
        assert_eq!(answering.pending_count(), 0);
        assert!(!answering.resolve(prompt.id, false));
    }

    #[tokio::test]
    async fn test_channel_handler_without_listener_denies() {
        let (handler, prompts) = ChannelAuthorizationHandler::new();
        drop(prompts);

        let granted = handler
            .on_authorization_request(AuthorizationRequest::for_install("p1", "x", "1", "", "P1"))
            .await;
        assert!(!granted);
        assert_eq!(handler.pending_count(), 0);
    }
}
