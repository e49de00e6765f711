//! Buyer Sessions
//!
//! Signed bearer tokens naming the buyer a request acts for. The buyer-facing
//! endpoints take the buyer from here, never from the request body.
//!
//! Token format: `{buyer_id}:{expires_at}:{hex hmac-sha256}`, signed over
//! `{buyer_id}:{expires_at}`.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{FulfillmentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default session lifetime
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// Issues and checks buyer session tokens
#[derive(Clone)]
pub struct SessionVerifier {
    secret: String,
    ttl_secs: i64,
}

impl std::fmt::Debug for SessionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVerifier")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl SessionVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, secs: i64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// Create from `SESSION_SECRET` and `SESSION_TTL_SECS`
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("SESSION_SECRET")
            .map_err(|_| FulfillmentError::Config("SESSION_SECRET not set".into()))?;
        let ttl = std::env::var("SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SESSION_TTL_SECS);

        Ok(Self::new(secret).with_ttl(ttl))
    }

    fn mac(&self, buyer_id: &str, expires_at: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| FulfillmentError::Config(format!("session secret: {e}")))?;
        mac.update(buyer_id.as_bytes());
        mac.update(b":");
        mac.update(expires_at.to_string().as_bytes());
        Ok(mac)
    }

    /// Token valid until `expires_at` (unix seconds)
    pub fn issue_until(&self, buyer_id: &str, expires_at: i64) -> Result<String> {
        if buyer_id.trim().is_empty() {
            return Err(FulfillmentError::InvalidRequest("buyer_id is required".into()));
        }
        let digest = self.mac(buyer_id, expires_at)?.finalize().into_bytes();
        Ok(format!("{buyer_id}:{expires_at}:{}", hex::encode(digest)))
    }

    /// Token valid for the configured lifetime
    pub fn issue(&self, buyer_id: &str) -> Result<String> {
        let expires_at = Utc::now().timestamp().saturating_add(self.ttl_secs);
        self.issue_until(buyer_id, expires_at)
    }

    /// Buyer id carried by a valid token
    pub fn verify(&self, token: &str) -> Result<String> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Verify against an explicit clock
    pub fn verify_at(&self, token: &str, now: i64) -> Result<String> {
        let malformed = || FulfillmentError::Unauthenticated("malformed session token".into());

        // Buyer ids may contain ':', the other two fields never do
        let (rest, signature) = token.rsplit_once(':').ok_or_else(malformed)?;
        let (buyer_id, expires_at) = rest.rsplit_once(':').ok_or_else(malformed)?;
        let expires_at: i64 = expires_at.parse().map_err(|_| malformed())?;
        if buyer_id.is_empty() {
            return Err(malformed());
        }

        let signature = hex::decode(signature).map_err(|_| malformed())?;
        self.mac(buyer_id, expires_at)?
            .verify_slice(&signature)
            .map_err(|_| FulfillmentError::Unauthenticated("session signature mismatch".into()))?;

        if now >= expires_at {
            return Err(FulfillmentError::Unauthenticated("session expired".into()));
        }

        Ok(buyer_id.to_string())
    }
}
