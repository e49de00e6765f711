//! # storefront-core
//!
//! Purchase fulfillment pipeline for the storefront: from "payment
//! succeeded" to "buyer has working access to what they bought".
//!
//! ## Flow
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Payment  │──▶│   Webhook   │──▶│ Fulfillment  │──▶│ Entitlement Store│
//! │ provider │   │   Ingress   │   │ Orchestrator │   └──────────────────┘
//! └──────────┘   └─────────────┘   └──────┬───────┘   ┌──────────────────┐
//!                                         └──────────▶│ Access Grant     │──▶ source host
//!                                                     │ Connector        │
//!                                                     └──────────────────┘
//!            buyer's browser ──poll──▶ status query ──▶ store (+ host check)
//! ```
//!
//! The source-control host is reached through the [`RepositoryHost`]
//! trait so the connector algorithm runs unchanged against GitHub or the
//! in-memory [`MockRepositoryHost`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storefront_core::{WebhookIngress, WebhookVerifier};
//!
//! let ingress = WebhookIngress::new(WebhookVerifier::from_env()?, orchestrator);
//! let outcome = ingress.receive(&body, Some(signature)).await?;
//! ```

pub mod catalog;
pub mod entitlement;
pub mod error;
pub mod grant;
pub mod lifecycle;
pub mod orchestrator;
pub mod poller;
pub mod session;
pub mod store;
pub mod webhook;

pub use catalog::{Catalog, CatalogItem, StaticCatalog};
pub use entitlement::{Entitlement, EntitlementId, FailureKind, GrantFailure, PurchaseIntent};
pub use error::{ConnectorError, FulfillmentError, Result};
pub use grant::{
    AccessGrant, AccessGrantConnector, AddCollaborator, ConnectorConfig, GrantOutcome,
    MockRepositoryHost, Permission, RepositoryHost, is_valid_login, is_valid_repository,
};
pub use lifecycle::{AccessStatus, FulfillmentStatus, LifecycleEvent};
pub use orchestrator::{
    FulfillmentConfig, FulfillmentOrchestrator, FulfillmentOutcome, FulfillmentReport,
    ItemOutcome, ItemResult,
};
pub use poller::{
    AcceptancePoller, AccessStatusView, HttpStatusSource, PollSummary, StatusQuery, StatusReport,
    StatusSource,
};
pub use session::SessionVerifier;
pub use store::{
    BuyerDirectory, EntitlementStore, InsertOutcome, MemoryBuyerDirectory,
    MemoryEntitlementStore,
};
pub use webhook::{WebhookEvent, WebhookIngress, WebhookOutcome, WebhookVerifier};
