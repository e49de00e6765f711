//! Entitlement Lifecycle
//!
//! Pure state machine for one entitlement. Nothing here touches a store or
//! the network, so every transition can be exercised directly.
//!
//! ```text
//! Pending ──Start──▶ Fulfilling ──AccessResolved──▶ Ready
//!                        │  ▲                         ▲
//!                        │  └── NotSent (no identity) │
//!                        └──────── Failed ──────▶ Degraded
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

/// Fulfillment status of an entitlement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Fulfilling,
    Ready,
    Degraded,
}

impl FulfillmentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilling => "fulfilling",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        }
    }
}

/// Access-grant status of an entitlement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    /// Item needs no repository access
    NotApplicable,
    /// Grant required but the buyer's identity is not linked yet
    NotSent,
    /// Invitation is waiting on the buyer
    Sent,
    Accepted,
    Failed,
}

impl AccessStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotApplicable => "not_applicable",
            Self::NotSent => "not_sent",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Failed => "failed",
        }
    }
}

/// Events that move an entitlement through its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Entitlement row is about to be written
    Start,
    /// Grant step finished with the given access status
    AccessResolved(AccessStatus),
    /// Buyer accepted the invitation on the host
    Accepted,
}

/// Compute the next status, or reject the event
pub fn transition(from: FulfillmentStatus, event: LifecycleEvent) -> Result<FulfillmentStatus> {
    use FulfillmentStatus::{Degraded, Fulfilling, Pending, Ready};

    let next = match (from, event) {
        (Pending, LifecycleEvent::Start) => Some(Fulfilling),
        (Fulfilling | Ready | Degraded, LifecycleEvent::AccessResolved(access)) => {
            Some(resolve(access))
        }
        (Fulfilling | Ready | Degraded, LifecycleEvent::Accepted) => Some(Ready),
        _ => None,
    };

    next.ok_or(FulfillmentError::InvalidTransition { from, event })
}

const fn resolve(access: AccessStatus) -> FulfillmentStatus {
    match access {
        AccessStatus::Accepted | AccessStatus::NotApplicable | AccessStatus::Sent => {
            FulfillmentStatus::Ready
        }
        AccessStatus::NotSent => FulfillmentStatus::Fulfilling,
        AccessStatus::Failed => FulfillmentStatus::Degraded,
    }
}
