//! Fulfillment Orchestrator
//!
//! Turns a confirmed purchase into entitlements, one per ordered item, and
//! provisions repository access where the item needs it. Item failures are
//! folded into entitlement state; they never fail the whole order.

use std::sync::Arc;

use futures::{StreamExt, stream};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::entitlement::{Entitlement, EntitlementId, FailureKind, PurchaseIntent};
use crate::error::{FulfillmentError, Result};
use crate::grant::{AccessGrantConnector, is_valid_login};
use crate::lifecycle::{AccessStatus, LifecycleEvent};
use crate::poller::AccessStatusView;
use crate::store::{BuyerDirectory, EntitlementStore, InsertOutcome};

/// Orchestrator tuning
#[derive(Clone, Debug)]
pub struct FulfillmentConfig {
    /// Items of one order provisioned at the same time
    pub max_concurrent_grants: usize,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_grants: 4,
        }
    }
}

impl FulfillmentConfig {
    pub fn from_env() -> Self {
        let max_concurrent_grants = std::env::var("MAX_CONCURRENT_GRANTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(4);

        Self {
            max_concurrent_grants,
        }
    }
}

/// Per-item result of a fulfillment run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemResult {
    Created { entitlement: Entitlement },
    /// Another delivery already wrote this entitlement
    AlreadyFulfilled { entitlement_id: EntitlementId },
    UnknownItem,
    /// Row written, but settling its access failed
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    #[serde(flatten)]
    pub result: ItemResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FulfillmentReport {
    pub payment_reference: String,
    pub items: Vec<ItemOutcome>,
}

impl FulfillmentReport {
    /// Entitlements created by this run
    pub fn created(&self) -> impl Iterator<Item = &Entitlement> {
        self.items.iter().filter_map(|i| match &i.result {
            ItemResult::Created { entitlement } => Some(entitlement),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FulfillmentOutcome {
    Fulfilled(FulfillmentReport),
    /// Payment reference was already fulfilled; nothing was done
    Duplicate { payment_reference: String },
}

/// Drives entitlements from `pending` to `ready` or `degraded`
pub struct FulfillmentOrchestrator {
    store: Arc<dyn EntitlementStore>,
    catalog: Arc<dyn Catalog>,
    directory: Arc<dyn BuyerDirectory>,
    connector: Arc<AccessGrantConnector>,
    config: FulfillmentConfig,
}

impl FulfillmentOrchestrator {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        catalog: Arc<dyn Catalog>,
        directory: Arc<dyn BuyerDirectory>,
        connector: Arc<AccessGrantConnector>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            directory,
            connector,
            config,
        }
    }

    pub fn connector(&self) -> &AccessGrantConnector {
        &self.connector
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrent_grants.max(1)
    }

    /// Fulfill a confirmed purchase; a no-op for an already seen payment.
    ///
    /// Deduplication is per item: the store refuses a second row for the
    /// same (buyer, item, payment), so a redelivery only fills in items an
    /// earlier attempt could not write and never re-grants existing ones.
    ///
    /// Errors when any item could not be written at all. Nothing durable
    /// exists for that item yet, so the provider has to deliver again.
    /// Failures after the row is written are recorded on the row instead.
    pub async fn fulfill(&self, intent: &PurchaseIntent) -> Result<FulfillmentOutcome> {
        let identity = self.resolve_identity(intent);

        let pending: Vec<_> = intent
            .item_ids
            .iter()
            .map(|item_id| self.fulfill_item(intent, item_id, identity.as_deref()))
            .collect();
        let results = stream::iter(pending)
            .buffered(self.concurrency())
            .collect::<Vec<_>>()
            .await;

        let mut items = Vec::with_capacity(results.len());
        let mut unrecorded = None;
        for result in results {
            match result {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::error!(
                        payment_reference = %intent.payment_reference,
                        error = %e,
                        "Item could not be recorded"
                    );
                    unrecorded.get_or_insert(e);
                }
            }
        }
        if let Some(e) = unrecorded {
            return Err(e);
        }

        // Nothing new was written: every known item already had its row
        let duplicate = items
            .iter()
            .any(|i| matches!(i.result, ItemResult::AlreadyFulfilled { .. }))
            && items.iter().all(|i| {
                matches!(
                    i.result,
                    ItemResult::AlreadyFulfilled { .. } | ItemResult::UnknownItem
                )
            });
        if duplicate {
            tracing::info!(
                payment_reference = %intent.payment_reference,
                event_id = %intent.event_id,
                "Payment already fulfilled, skipping"
            );
            return Ok(FulfillmentOutcome::Duplicate {
                payment_reference: intent.payment_reference.clone(),
            });
        }

        tracing::info!(
            payment_reference = %intent.payment_reference,
            buyer_id = %intent.buyer_id,
            items = items.len(),
            "Purchase fulfilled"
        );

        Ok(FulfillmentOutcome::Fulfilled(FulfillmentReport {
            payment_reference: intent.payment_reference.clone(),
            items,
        }))
    }

    /// Known identity for the buyer, linking the one from checkout if new
    fn resolve_identity(&self, intent: &PurchaseIntent) -> Option<String> {
        let linked = self
            .directory
            .identity(&intent.buyer_id)
            .unwrap_or_else(|e| {
                tracing::warn!(buyer_id = %intent.buyer_id, error = %e, "Identity lookup failed");
                None
            });

        if linked.is_some() {
            return linked;
        }

        let supplied = intent
            .external_identity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;

        if !is_valid_login(supplied) {
            tracing::warn!(
                buyer_id = %intent.buyer_id,
                identity = supplied,
                "Ignoring invalid identity from checkout"
            );
            return None;
        }

        match self.directory.link_identity(&intent.buyer_id, supplied) {
            Ok(()) => {
                tracing::info!(
                    buyer_id = %intent.buyer_id,
                    identity = supplied,
                    "Linked buyer identity"
                );
            }
            Err(e) => {
                tracing::warn!(buyer_id = %intent.buyer_id, error = %e, "Could not link identity");
            }
        }

        Some(supplied.to_string())
    }

    /// Record one item, then provision it.
    ///
    /// `Err` only when no row could be written for the item.
    async fn fulfill_item(
        &self,
        intent: &PurchaseIntent,
        item_id: &str,
        identity: Option<&str>,
    ) -> Result<ItemOutcome> {
        let Some(item) = self.catalog.item(item_id) else {
            tracing::warn!(
                payment_reference = %intent.payment_reference,
                item_id,
                "Unknown item in order, skipping"
            );
            return Ok(ItemOutcome {
                item_id: item_id.to_string(),
                result: ItemResult::UnknownItem,
            });
        };

        let mut entitlement = Entitlement::new(
            &intent.buyer_id,
            &item.id,
            &intent.payment_reference,
            item.price_cents,
            &item.currency,
            item.repository.clone(),
        );
        entitlement.apply(LifecycleEvent::Start)?;

        // Record ownership before any external call
        let result = match self.store.insert(&entitlement)? {
            InsertOutcome::Duplicate(existing) => {
                tracing::info!(entitlement_id = %existing, item_id, "Entitlement already exists");
                ItemResult::AlreadyFulfilled {
                    entitlement_id: existing,
                }
            }
            InsertOutcome::Inserted => match self.settle(&mut entitlement, identity).await {
                Ok(()) => ItemResult::Created { entitlement },
                Err(e) => {
                    tracing::error!(
                        entitlement_id = %entitlement.id,
                        item_id,
                        error = %e,
                        "Entitlement recorded but not settled"
                    );
                    ItemResult::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        };

        Ok(ItemOutcome {
            item_id: item_id.to_string(),
            result,
        })
    }

    /// Resolve access for a freshly written row and persist the result
    async fn settle(&self, entitlement: &mut Entitlement, identity: Option<&str>) -> Result<()> {
        match identity {
            Some(invitee) if entitlement.repository.is_some() => {
                self.provision(entitlement, invitee).await?;
            }
            _ => entitlement.apply(LifecycleEvent::AccessResolved(entitlement.access))?,
        }

        self.store.update(entitlement)?;

        tracing::info!(
            entitlement_id = %entitlement.id,
            item_id = %entitlement.item_id,
            status = entitlement.status.as_str(),
            access = entitlement.access.as_str(),
            "Entitlement recorded"
        );
        Ok(())
    }

    /// Run the grant step and fold its result into the entitlement
    async fn provision(&self, entitlement: &mut Entitlement, invitee: &str) -> Result<()> {
        let Some(repository) = entitlement.repository.clone() else {
            return Ok(());
        };

        match self.connector.grant(&repository, invitee).await {
            Ok(grant) => entitlement.record_grant(&grant),
            Err(e) => {
                tracing::warn!(
                    entitlement_id = %entitlement.id,
                    repository = %repository,
                    error = %e,
                    "Access grant failed, entitlement degraded"
                );
                let kind = if e.is_retryable() {
                    FailureKind::Unavailable
                } else {
                    FailureKind::Rejected
                };
                entitlement.record_failure(kind, e.to_string())
            }
        }
    }

    /// Link a buyer's source-control identity and grant access for every
    /// entitlement that was waiting on it. Returns the entitlements touched.
    pub async fn link_identity(&self, buyer_id: &str, username: &str) -> Result<Vec<Entitlement>> {
        let buyer_id = buyer_id.trim();
        let username = username.trim();
        if buyer_id.is_empty() || username.is_empty() {
            return Err(FulfillmentError::InvalidRequest(
                "buyer id and username are required".into(),
            ));
        }
        if !is_valid_login(username) {
            return Err(FulfillmentError::InvalidRequest(format!(
                "not a valid username: {username}"
            )));
        }

        self.directory.link_identity(buyer_id, username)?;

        let waiting: Vec<Entitlement> = self
            .store
            .list_for_buyer(buyer_id)?
            .into_iter()
            .filter(Entitlement::awaits_identity)
            .collect();

        tracing::info!(buyer_id, username, waiting = waiting.len(), "Identity linked");

        let results = stream::iter(waiting)
            .map(|mut entitlement| async move {
                self.provision(&mut entitlement, username).await?;
                self.store.update(&entitlement)?;
                Ok::<_, FulfillmentError>(entitlement)
            })
            .buffered(self.concurrency())
            .collect::<Vec<_>>()
            .await;

        let mut updated = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(entitlement) => updated.push(entitlement),
                Err(e) => tracing::error!(buyer_id, error = %e, "Grant after identity link failed"),
            }
        }

        Ok(updated)
    }

    /// Current access status of the buyer's entitlements among `ids`.
    ///
    /// Ids that do not exist or belong to another buyer are left out. For
    /// invitations still outstanding the host is asked whether the buyer has
    /// accepted, and an acceptance is persisted before answering.
    pub async fn access_statuses(
        &self,
        buyer_id: &str,
        ids: &[EntitlementId],
    ) -> Result<Vec<AccessStatusView>> {
        let identity = self.directory.identity(buyer_id)?;
        let mut views = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(mut entitlement) = self.store.get(id)? else {
                continue;
            };
            if entitlement.buyer_id != buyer_id {
                continue;
            }

            if entitlement.access == AccessStatus::Sent {
                if let Some(invitee) = identity.as_deref() {
                    entitlement = self.refresh_acceptance(entitlement, invitee).await;
                }
            }

            views.push(AccessStatusView::from(&entitlement));
        }

        Ok(views)
    }

    async fn refresh_acceptance(&self, entitlement: Entitlement, invitee: &str) -> Entitlement {
        let Some(repository) = entitlement.repository.as_deref() else {
            return entitlement;
        };

        match self.connector.has_accepted(repository, invitee).await {
            Ok(true) => {
                let mut accepted = entitlement.clone();
                match accepted.record_accepted().and_then(|()| self.store.update(&accepted)) {
                    Ok(()) => {
                        tracing::info!(entitlement_id = %accepted.id, "Invitation accepted");
                        accepted
                    }
                    Err(e) => {
                        tracing::warn!(
                            entitlement_id = %entitlement.id,
                            error = %e,
                            "Could not record acceptance"
                        );
                        entitlement
                    }
                }
            }
            Ok(false) => entitlement,
            Err(e) => {
                tracing::debug!(
                    entitlement_id = %entitlement.id,
                    error = %e,
                    "Acceptance check failed"
                );
                entitlement
            }
        }
    }

    /// Everything the buyer owns
    pub fn entitlements_for(&self, buyer_id: &str) -> Result<Vec<Entitlement>> {
        self.store.list_for_buyer(buyer_id)
    }
}
