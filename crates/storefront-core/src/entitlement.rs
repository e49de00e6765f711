//! Entitlements and Purchase Intents
//!
//! An entitlement is the durable proof that a buyer owns one item from one
//! payment. It is never deleted; grant problems are recorded on it instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::grant::{AccessGrant, GrantOutcome};
use crate::lifecycle::{AccessStatus, FulfillmentStatus, LifecycleEvent, transition};

/// Unique entitlement identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitlementId(Uuid);

impl EntitlementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for EntitlementId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntitlementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A confirmed checkout, built from a verified payment event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseIntent {
    /// Provider payment reference (idempotency key)
    pub payment_reference: String,

    /// Provider event that carried this purchase
    pub event_id: String,

    pub buyer_id: String,

    /// Item identifiers in cart order
    pub item_ids: Vec<String>,

    /// Total charged, in minor units
    pub amount_cents: i64,

    pub currency: String,

    /// Buyer's source-control username, when checkout captured it
    #[serde(default)]
    pub external_identity: Option<String>,
}

/// Why an access grant did not complete
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The host answered no; retrying will not help
    Rejected,
    /// The host could not be reached or refused our credentials
    Unavailable,
}

/// Last grant failure recorded on an entitlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// One (buyer, item, payment) ownership record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: EntitlementId,
    pub buyer_id: String,
    pub item_id: String,
    pub payment_reference: String,

    /// Price paid, in minor units
    pub price_cents: i64,
    pub currency: String,

    /// Private artifact repository, if the item needs access provisioning
    pub repository: Option<String>,

    pub status: FulfillmentStatus,
    pub access: AccessStatus,

    #[serde(default)]
    pub failure: Option<GrantFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Create a pending entitlement
    pub fn new(
        buyer_id: impl Into<String>,
        item_id: impl Into<String>,
        payment_reference: impl Into<String>,
        price_cents: i64,
        currency: impl Into<String>,
        repository: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let access = if repository.is_some() {
            AccessStatus::NotSent
        } else {
            AccessStatus::NotApplicable
        };

        Self {
            id: EntitlementId::new(),
            buyer_id: buyer_id.into(),
            item_id: item_id.into(),
            payment_reference: payment_reference.into(),
            price_cents,
            currency: currency.into(),
            repository,
            status: FulfillmentStatus::Pending,
            access,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Uniqueness key enforced by the store
    pub fn key(&self) -> EntitlementKey {
        EntitlementKey {
            buyer_id: self.buyer_id.clone(),
            item_id: self.item_id.clone(),
            payment_reference: self.payment_reference.clone(),
        }
    }

    /// Apply a lifecycle event
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<()> {
        self.status = transition(self.status, event)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold a completed grant into the record
    pub fn record_grant(&mut self, grant: &AccessGrant) -> Result<()> {
        let access = grant.outcome.access_status();
        self.access = access;
        self.failure = match grant.outcome {
            GrantOutcome::RepositoryMissing | GrantOutcome::Rejected => Some(GrantFailure {
                kind: FailureKind::Rejected,
                message: format!("{} for {}", grant.outcome.as_str(), grant.repository),
            }),
            _ => None,
        };
        self.apply(LifecycleEvent::AccessResolved(access))
    }

    /// Record a grant step that ended without an answer from the host
    pub fn record_failure(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<()> {
        self.access = AccessStatus::Failed;
        self.failure = Some(GrantFailure {
            kind,
            message: message.into(),
        });
        self.apply(LifecycleEvent::AccessResolved(AccessStatus::Failed))
    }

    /// Record that the buyer accepted the invitation
    pub fn record_accepted(&mut self) -> Result<()> {
        self.apply(LifecycleEvent::Accepted)?;
        self.access = AccessStatus::Accepted;
        self.failure = None;
        Ok(())
    }

    /// Whether the grant step still has to run once an identity is known
    pub fn awaits_identity(&self) -> bool {
        self.repository.is_some() && self.access == AccessStatus::NotSent
    }
}

/// (buyer, item, payment) uniqueness key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntitlementKey {
    pub buyer_id: String,
    pub item_id: String,
    pub payment_reference: String,
}
