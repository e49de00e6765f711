//! Application State

use std::sync::Arc;

use storefront_core::{FulfillmentOrchestrator, SessionVerifier, WebhookIngress};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Entitlement creation, identity linking and status queries
    pub orchestrator: Arc<FulfillmentOrchestrator>,

    /// Webhook ingress (None if no webhook secret is configured)
    pub webhook: Option<Arc<WebhookIngress>>,

    /// Buyer session tokens (None disables the buyer-facing API)
    pub sessions: Option<Arc<SessionVerifier>>,
}
