//! Acceptance Poller
//!
//! Pull-based discovery of invitation acceptance. Acceptance happens on the
//! host with no webhook, so the buyer's client asks for the current status
//! of its pending entitlements at a fixed interval until each of them is
//! either `accepted` or `failed`. The server keeps no polling state; a
//! client stops early simply by dropping the polling future.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entitlement::{Entitlement, EntitlementId};
use crate::error::Result;
use crate::lifecycle::{AccessStatus, FulfillmentStatus};

/// Status of one entitlement as reported to the buyer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStatusView {
    pub entitlement_id: EntitlementId,
    pub item_id: String,
    pub access: AccessStatus,
    pub status: FulfillmentStatus,
}

impl From<&Entitlement> for AccessStatusView {
    fn from(e: &Entitlement) -> Self {
        Self {
            entitlement_id: e.id,
            item_id: e.item_id.clone(),
            access: e.access,
            status: e.status,
        }
    }
}

/// Body of a status query. The buyer comes from the session, not the body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub entitlement_ids: Vec<EntitlementId>,
}

/// Answer to a status query
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub statuses: Vec<AccessStatusView>,
    pub all_accepted: bool,
}

impl StatusReport {
    /// `all_accepted` holds only when every requested id came back accepted.
    /// Ids that were left out (unknown, or owned by someone else) count as
    /// not accepted, and so does an empty request.
    pub fn new(requested: &[EntitlementId], statuses: Vec<AccessStatusView>) -> Self {
        let all_accepted = !requested.is_empty()
            && requested.iter().all(|id| {
                statuses
                    .iter()
                    .any(|s| s.entitlement_id == *id && s.access == AccessStatus::Accepted)
            });
        Self {
            statuses,
            all_accepted,
        }
    }
}

/// Where the poller reads statuses from
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn query(&self, ids: &[EntitlementId]) -> Result<Vec<AccessStatusView>>;
}

/// Status source backed by the storefront HTTP API.
/// Authenticates with a session token issued to the buyer.
pub struct HttpStatusSource {
    client: reqwest::Client,
    endpoint: String,
    session_token: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str, session_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/entitlements/status", base_url.trim_end_matches('/')),
            session_token: session_token.into(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn query(&self, ids: &[EntitlementId]) -> Result<Vec<AccessStatusView>> {
        let body = StatusQuery {
            entitlement_ids: ids.to_vec(),
        };

        let report: StatusReport = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.session_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(report.statuses)
    }
}

/// How a finished polling run went
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Queries issued, including failed ones
    pub rounds: u32,
    /// Ids that ended with a failed grant instead of an acceptance
    pub failed: Vec<EntitlementId>,
}

/// Client-side polling loop
pub struct AcceptancePoller<S: StatusSource> {
    source: S,
    interval: Duration,
}

impl<S: StatusSource> AcceptancePoller<S> {
    pub const fn new(source: S, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Poll interval from `POLL_INTERVAL_SECS`, default 3 seconds
    pub fn from_env(source: S) -> Self {
        let secs = std::env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        Self::new(source, Duration::from_secs(secs))
    }

    /// Poll until every id reports `accepted` or `failed`.
    ///
    /// `on_update` sees each successful response. Query errors are logged
    /// and retried on the next tick. Ids that reached either terminal status
    /// are not asked for again; failed ones are returned in the summary so
    /// the caller can offer a retry. There is no deadline: a buyer who never
    /// accepts keeps the loop going until the caller drops it.
    pub async fn run<F>(&self, ids: &[EntitlementId], mut on_update: F) -> PollSummary
    where
        F: FnMut(&[AccessStatusView]) + Send,
    {
        let mut pending: BTreeSet<EntitlementId> = ids.iter().copied().collect();
        let mut rounds = 0;
        let mut failed = Vec::new();

        while !pending.is_empty() {
            if rounds > 0 {
                tokio::time::sleep(self.interval).await;
            }
            rounds += 1;

            let batch: Vec<EntitlementId> = pending.iter().copied().collect();
            match self.source.query(&batch).await {
                Ok(statuses) => {
                    for view in &statuses {
                        match view.access {
                            AccessStatus::Accepted => {
                                pending.remove(&view.entitlement_id);
                            }
                            AccessStatus::Failed => {
                                if pending.remove(&view.entitlement_id) {
                                    failed.push(view.entitlement_id);
                                }
                            }
                            _ => {}
                        }
                    }
                    on_update(&statuses);
                }
                Err(e) => {
                    tracing::warn!(round = rounds, error = %e, "Status query failed, retrying");
                }
            }
        }

        PollSummary { rounds, failed }
    }
}
