//! Payment Webhook Ingress
//!
//! Verifies Stripe-style signed events, picks out confirmed payments and
//! hands them to the orchestrator. Once the signature checks out every
//! outcome is an acknowledgment: duplicates, unrelated event types and
//! events missing purchase data are all reported as handled so the
//! provider does not retry them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::entitlement::PurchaseIntent;
use crate::error::{FulfillmentError, Result};
use crate::orchestrator::{FulfillmentOrchestrator, FulfillmentOutcome, FulfillmentReport};

type HmacSha256 = Hmac<Sha256>;

/// Event types that confirm a charge
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";

/// Default allowed clock skew between signer and us
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Checks the `t=...,v1=...` signature header
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    #[must_use]
    pub const fn with_tolerance(mut self, secs: i64) -> Self {
        self.tolerance_secs = secs;
        self
    }

    /// Create from `STRIPE_WEBHOOK_SECRET` and `WEBHOOK_TOLERANCE_SECS`
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| FulfillmentError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;
        let tolerance = std::env::var("WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOLERANCE_SECS);

        Ok(Self::new(secret).with_tolerance(tolerance))
    }

    fn mac(&self, payload: &[u8], timestamp: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| FulfillmentError::Config(format!("webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Build a signature header for `payload` (tests and replay tooling)
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let digest = self.mac(payload, timestamp)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        let mut timestamp = None;
        let mut candidates = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| FulfillmentError::WebhookSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(FulfillmentError::WebhookSignature("missing v1 signature".into()));
        }

        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(FulfillmentError::WebhookSignature(
                "timestamp outside tolerance".into(),
            ));
        }

        let expected = self.mac(payload, timestamp)?;
        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .is_ok_and(|bytes| expected.clone().verify_slice(&bytes).is_ok())
        });

        if matched {
            Ok(())
        } else {
            Err(FulfillmentError::WebhookSignature("signature mismatch".into()))
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: serde_json::Value,
}

/// Id field that may arrive expanded into an object
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

/// Fields read from a checkout session or payment intent
#[derive(Deserialize)]
struct PaymentObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<Expandable>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Parsed webhook event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Charge confirmed; fulfill this purchase
    PaymentConfirmed {
        event_type: String,
        intent: PurchaseIntent,
    },

    /// Relevant type, but the purchase data is not usable
    Unusable { event_type: String, reason: String },

    /// Anything else, including unpaid checkout sessions
    Other { event_type: String },
}

/// Parse a verified payload. Call only after the signature checks out.
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent> {
    let event: RawEvent = serde_json::from_slice(payload)
        .map_err(|e| FulfillmentError::WebhookParse(e.to_string()))?;

    let event_type = event.event_type;
    if event_type != CHECKOUT_COMPLETED && event_type != PAYMENT_INTENT_SUCCEEDED {
        return Ok(WebhookEvent::Other { event_type });
    }

    let object: PaymentObject = match serde_json::from_value(event.data.object) {
        Ok(object) => object,
        Err(e) => {
            return Ok(WebhookEvent::Unusable {
                event_type,
                reason: format!("payment object: {e}"),
            });
        }
    };

    if event_type == CHECKOUT_COMPLETED
        && object.payment_status.as_deref().is_some_and(|s| s != "paid")
    {
        tracing::info!(event_id = %event.id, "Checkout completed but not paid yet");
        return Ok(WebhookEvent::Other { event_type });
    }

    match purchase_from(event.id, &event_type, object) {
        Ok(intent) => Ok(WebhookEvent::PaymentConfirmed { event_type, intent }),
        Err(reason) => Ok(WebhookEvent::Unusable { event_type, reason }),
    }
}

fn purchase_from(
    event_id: String,
    event_type: &str,
    mut object: PaymentObject,
) -> std::result::Result<PurchaseIntent, String> {
    let buyer_id = object
        .metadata
        .remove("user_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("metadata.user_id missing")?;

    let item_ids: Vec<String> = object
        .metadata
        .get("skill_ids")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if item_ids.is_empty() {
        return Err("metadata.skill_ids missing or empty".into());
    }

    let payment_reference = match (event_type, object.payment_intent) {
        (CHECKOUT_COMPLETED, Some(intent)) => intent.into_id(),
        _ => object.id,
    };

    Ok(PurchaseIntent {
        payment_reference,
        event_id,
        buyer_id,
        item_ids,
        amount_cents: object
            .amount_total
            .or(object.amount_received)
            .or(object.amount)
            .unwrap_or_default(),
        currency: object.currency.unwrap_or_default().to_lowercase(),
        external_identity: object
            .metadata
            .remove("github_username")
            .filter(|s| !s.trim().is_empty()),
    })
}

/// What the ingress did with a delivery
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Fulfilled {
        event_id: String,
        report: FulfillmentReport,
    },
    Duplicate {
        event_id: String,
        payment_reference: String,
    },
    Ignored {
        event_type: String,
    },
    Unusable {
        event_type: String,
        reason: String,
    },
}

/// Authenticated entry point for payment events
pub struct WebhookIngress {
    verifier: WebhookVerifier,
    orchestrator: Arc<FulfillmentOrchestrator>,
}

impl WebhookIngress {
    pub const fn new(
        verifier: WebhookVerifier,
        orchestrator: Arc<FulfillmentOrchestrator>,
    ) -> Self {
        Self {
            verifier,
            orchestrator,
        }
    }

    /// Verify, classify and dispatch one delivery.
    ///
    /// Errors: signature problems, an unparseable signed body, and an item
    /// the store could not write (the provider must redeliver). Everything
    /// else is `Ok`.
    pub async fn receive(&self, payload: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        let signature = signature
            .ok_or_else(|| FulfillmentError::WebhookSignature("missing signature header".into()))?;
        self.verifier.verify(payload, signature)?;

        match parse_event(payload)? {
            WebhookEvent::PaymentConfirmed { event_type, intent } => {
                tracing::info!(
                    event_id = %intent.event_id,
                    event_type = %event_type,
                    payment_reference = %intent.payment_reference,
                    items = intent.item_ids.len(),
                    "Processing payment webhook"
                );

                let event_id = intent.event_id.clone();
                Ok(match self.orchestrator.fulfill(&intent).await? {
                    FulfillmentOutcome::Fulfilled(report) => {
                        WebhookOutcome::Fulfilled { event_id, report }
                    }
                    FulfillmentOutcome::Duplicate { payment_reference } => {
                        WebhookOutcome::Duplicate {
                            event_id,
                            payment_reference,
                        }
                    }
                })
            }

            WebhookEvent::Unusable { event_type, reason } => {
                tracing::warn!(
                    event_type = %event_type,
                    %reason,
                    "Payment event missing purchase data"
                );
                Ok(WebhookOutcome::Unusable { event_type, reason })
            }

            WebhookEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                Ok(WebhookOutcome::Ignored { event_type })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogItem, StaticCatalog};
    use crate::grant::{AccessGrantConnector, ConnectorConfig, MockRepositoryHost};
    use crate::lifecycle::AccessStatus;
    use crate::orchestrator::FulfillmentConfig;
    use crate::store::{EntitlementStore, MemoryBuyerDirectory, MemoryEntitlementStore};

    const SECRET: &str = "whsec_test123secret456";

    fn checkout_payload(payment_intent: &str, skills: &str) -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": CHECKOUT_COMPLETED,
            "data": {"object": {
                "id": "cs_test_1",
                "payment_intent": payment_intent,
                "payment_status": "paid",
                "amount_total": 2400,
                "currency": "USD",
                "metadata": {"user_id": "u1", "skill_ids": skills}
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn ingress() -> (WebhookIngress, Arc<MemoryEntitlementStore>) {
        let store = Arc::new(MemoryEntitlementStore::new());
        let catalog = StaticCatalog::new([
            CatalogItem {
                id: "skillA".into(),
                name: "Skill A".into(),
                price_cents: 1500,
                currency: "usd".into(),
                repository: Some("r-a".into()),
            },
            CatalogItem {
                id: "skillB".into(),
                name: "Skill B".into(),
                price_cents: 900,
                currency: "usd".into(),
                repository: None,
            },
        ]);
        let host = Arc::new(MockRepositoryHost::new().with_repository("r-a"));
        let orchestrator = FulfillmentOrchestrator::new(
            store.clone(),
            Arc::new(catalog),
            Arc::new(MemoryBuyerDirectory::new()),
            Arc::new(AccessGrantConnector::new(host, ConnectorConfig::default())),
            FulfillmentConfig::default(),
        );

        (
            WebhookIngress::new(WebhookVerifier::new(SECRET), Arc::new(orchestrator)),
            store,
        )
    }

    fn signed(payload: &[u8]) -> String {
        WebhookVerifier::new(SECRET)
            .sign(payload, Utc::now().timestamp())
            .unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let verifier = WebhookVerifier::new(SECRET);
        let payload = b"{\"type\":\"checkout.session.completed\"}";
        let header = verifier.sign(payload, 1_700_000_000).unwrap();
        assert!(verifier.verify_at(payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"{}";
        let header = WebhookVerifier::new("wrong_secret").sign(payload, 1_700_000_000).unwrap();
        let err = WebhookVerifier::new(SECRET)
            .verify_at(payload, &header, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::WebhookSignature(_)));
    }

    #[test]
    fn test_modified_payload_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = verifier.sign(b"{\"a\":1}", 1_700_000_000).unwrap();
        assert!(verifier.verify_at(b"{\"a\":2}", &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = verifier.sign(b"{}", 1_700_000_000).unwrap();
        assert!(verifier.verify_at(b"{}", &header, 1_700_000_600).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={t},v1=00");
            let err = verifier.verify(b"{}", &header).unwrap_err();
            assert!(matches!(err, FulfillmentError::WebhookSignature(_)));
            assert!(verifier.verify_at(b"{}", &header, i64::MIN).is_err());
            assert!(verifier.verify_at(b"{}", &header, i64::MAX).is_err());
        }
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        for header in ["", "garbage", "v1=abcd", "t=1700000000", "t=1700000000,v1=zz"] {
            assert!(
                verifier.verify_at(b"{}", header, 1_700_000_000).is_err(),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = verifier.sign(b"{}", 1_700_000_000).unwrap();
        let rotated = header.replace("t=1700000000,", "t=1700000000,v1=deadbeef,");
        assert!(verifier.verify_at(b"{}", &rotated, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_parse_checkout_event() {
        let event = parse_event(&checkout_payload("pi_123", "skillA, skillB,,")).unwrap();
        let WebhookEvent::PaymentConfirmed { intent, .. } = event else {
            panic!("expected confirmed payment");
        };
        assert_eq!(intent.payment_reference, "pi_123");
        assert_eq!(intent.buyer_id, "u1");
        assert_eq!(intent.item_ids, vec!["skillA", "skillB"]);
        assert_eq!(intent.amount_cents, 2400);
        assert_eq!(intent.currency, "usd");
        assert_eq!(intent.external_identity, None);
    }

    #[test]
    fn test_parse_payment_intent_event() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": PAYMENT_INTENT_SUCCEEDED,
            "data": {"object": {
                "id": "pi_123",
                "amount_received": 2400,
                "currency": "usd",
                "metadata": {"user_id": "u1", "skill_ids": "skillA", "github_username": "octocat"}
            }}
        });
        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        let WebhookEvent::PaymentConfirmed { intent, .. } = event else {
            panic!("expected confirmed payment");
        };
        assert_eq!(intent.payment_reference, "pi_123");
        assert_eq!(intent.external_identity.as_deref(), Some("octocat"));
    }

    #[test]
    fn test_parse_other_and_unusable() {
        let other = serde_json::json!({
            "id": "evt_3", "type": "customer.created", "data": {"object": {}}
        });
        assert!(matches!(
            parse_event(other.to_string().as_bytes()).unwrap(),
            WebhookEvent::Other { .. }
        ));

        let unpaid = serde_json::json!({
            "id": "evt_4", "type": CHECKOUT_COMPLETED,
            "data": {"object": {"id": "cs_1", "payment_status": "unpaid",
                                "metadata": {"user_id": "u1", "skill_ids": "skillA"}}}
        });
        assert!(matches!(
            parse_event(unpaid.to_string().as_bytes()).unwrap(),
            WebhookEvent::Other { .. }
        ));

        let no_buyer = serde_json::json!({
            "id": "evt_5", "type": PAYMENT_INTENT_SUCCEEDED,
            "data": {"object": {"id": "pi_9", "metadata": {"skill_ids": "skillA"}}}
        });
        assert!(matches!(
            parse_event(no_buyer.to_string().as_bytes()).unwrap(),
            WebhookEvent::Unusable { .. }
        ));

        assert!(matches!(
            parse_event(b"not json"),
            Err(FulfillmentError::WebhookParse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_signature_never_parses() {
        let (ingress, store) = ingress();
        let err = ingress
            .receive(&checkout_payload("pi_123", "skillA"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::WebhookSignature(_)));
        assert!(!store.has_payment("pi_123").unwrap());
    }

    #[tokio::test]
    async fn test_same_event_delivered_many_times() {
        let (ingress, store) = ingress();
        let payload = checkout_payload("pi_123", "skillA,skillB");

        let first = ingress.receive(&payload, Some(&signed(&payload))).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Fulfilled { .. }));

        for _ in 0..4 {
            let again = ingress.receive(&payload, Some(&signed(&payload))).await.unwrap();
            assert!(matches!(again, WebhookOutcome::Duplicate { .. }));
        }

        let rows = store.list_for_payment("pi_123").unwrap();
        assert_eq!(rows.len(), 2);
        let a = rows.iter().find(|e| e.item_id == "skillA").unwrap();
        assert_eq!(a.access, AccessStatus::NotSent);
        let b = rows.iter().find(|e| e.item_id == "skillB").unwrap();
        assert_eq!(b.access, AccessStatus::NotApplicable);
    }

    #[tokio::test]
    async fn test_checkout_and_intent_events_share_reference() {
        let (ingress, store) = ingress();
        let checkout = checkout_payload("pi_123", "skillB");
        ingress.receive(&checkout, Some(&signed(&checkout))).await.unwrap();

        let intent = serde_json::json!({
            "id": "evt_2",
            "type": PAYMENT_INTENT_SUCCEEDED,
            "data": {"object": {
                "id": "pi_123", "amount": 900, "currency": "usd",
                "metadata": {"user_id": "u1", "skill_ids": "skillB"}
            }}
        })
        .to_string()
        .into_bytes();
        let outcome = ingress.receive(&intent, Some(&signed(&intent))).await.unwrap();

        assert!(matches!(outcome, WebhookOutcome::Duplicate { .. }));
        assert_eq!(store.list_for_payment("pi_123").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_event_acknowledged() {
        let (ingress, _) = ingress();
        let payload = br#"{"id":"evt_9","type":"invoice.created","data":{"object":{}}}"#;
        let outcome = ingress.receive(payload, Some(&signed(payload))).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                event_type: "invoice.created".into()
            }
        );
    }
}
