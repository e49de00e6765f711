//! storefront HTTP Server
//!
//! Axum-based server that receives payment webhooks, turns them into
//! entitlements, grants repository access on GitHub and answers the
//! buyer's status polls.

mod handlers;
mod router;
mod state;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_core::{
    AccessGrantConnector, ConnectorConfig, FulfillmentConfig, FulfillmentOrchestrator,
    MemoryBuyerDirectory, MemoryEntitlementStore, MockRepositoryHost, RepositoryHost,
    SessionVerifier, StaticCatalog, WebhookIngress, WebhookVerifier,
};
use storefront_runtime::GitHubHost;

use crate::router::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Repository host
    let host: Arc<dyn RepositoryHost> = match GitHubHost::from_env() {
        Ok(github) => {
            tracing::info!("✓ GitHub configured for owner {}", github.owner());
            Arc::new(github)
        }
        Err(e) => {
            tracing::warn!("⚠ GitHub not configured ({}) - using in-memory host", e);
            tracing::warn!("  Set GITHUB_TOKEN and GITHUB_OWNER in .env");
            Arc::new(MockRepositoryHost::new())
        }
    };
    let connector = Arc::new(AccessGrantConnector::new(host, ConnectorConfig::from_env()));

    // Catalog
    let catalog_path = std::env::var("CATALOG_PATH").unwrap_or_else(|_| "catalog.json".into());
    let catalog = match StaticCatalog::from_file(&catalog_path) {
        Ok(catalog) => {
            tracing::info!("✓ Loaded {} catalog items from {}", catalog.len(), catalog_path);
            catalog
        }
        Err(e) => {
            tracing::warn!("⚠ Catalog not loaded: {}", e);
            tracing::warn!("  Every purchased item will be reported as unknown");
            StaticCatalog::default()
        }
    };

    let orchestrator = Arc::new(FulfillmentOrchestrator::new(
        Arc::new(MemoryEntitlementStore::new()),
        Arc::new(catalog),
        Arc::new(MemoryBuyerDirectory::new()),
        connector,
        FulfillmentConfig::from_env(),
    ));

    // Payments
    let webhook = match WebhookVerifier::from_env() {
        Ok(verifier) => {
            tracing::info!("✓ Stripe webhook secret configured");
            Some(Arc::new(WebhookIngress::new(verifier, orchestrator.clone())))
        }
        Err(_) => {
            tracing::warn!("⚠ Stripe not configured - webhook disabled");
            tracing::warn!("  Set STRIPE_WEBHOOK_SECRET in .env");
            None
        }
    };

    // Buyer sessions
    let sessions = match SessionVerifier::from_env() {
        Ok(verifier) => {
            tracing::info!("✓ Session secret configured");
            Some(Arc::new(verifier))
        }
        Err(_) => {
            tracing::warn!("⚠ Sessions not configured - buyer API disabled");
            tracing::warn!("  Set SESSION_SECRET in .env");
            None
        }
    };

    let state = AppState {
        orchestrator,
        webhook,
        sessions,
    };
    let app = build_router(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 storefront server running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                          - Health check");
    tracing::info!("  POST /webhook/stripe                  - Payment webhook");
    tracing::info!("  POST /api/entitlements/status         - Access status poll");
    tracing::info!("  POST /api/identity                    - Link GitHub username");
    tracing::info!("  GET  /api/buyers/{{buyer_id}}/entitlements - Owned items");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
