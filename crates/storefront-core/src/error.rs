//! Fulfillment Error Types

use thiserror::Error;

use crate::lifecycle::{FulfillmentStatus, LifecycleEvent};

/// Result type alias
pub type Result<T> = std::result::Result<T, FulfillmentError>;

/// Errors raised by the fulfillment pipeline
#[derive(Error, Debug)]
pub enum FulfillmentError {
    /// Webhook signature missing, malformed, stale or wrong
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Signed webhook payload could not be parsed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Caller supplied unusable input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// State machine rejected an event
    #[error("Invalid transition: {event:?} from {from:?}")]
    InvalidTransition {
        from: FulfillmentStatus,
        event: LifecycleEvent,
    },

    /// Caller could not be identified
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Request contradicts existing state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Entitlement not found
    #[error("Entitlement not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Access grant connector failure
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// HTTP error talking to the storefront API
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FulfillmentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Network(_) => true,
            Self::Connector(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            Self::WebhookSignature(_) => "Webhook signature could not be verified.",
            Self::WebhookParse(_) => "Webhook payload could not be read.",
            Self::InvalidRequest(_) => "The request was missing required fields.",
            Self::Unauthenticated(_) => "Please sign in again.",
            Self::Conflict(_) => "A different GitHub account is already linked.",
            Self::NotFound(_) => "Purchase not found.",
            Self::Config(_) => "Service configuration error.",
            Self::Connector(_) => "Repository access could not be provisioned yet.",
            _ => "An error occurred processing your request.",
        }
    }
}

/// Failures talking to the source-control host.
///
/// These are distinct from a host *answer* (repository missing, invitee
/// refused), which are terminal grant outcomes rather than errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Invalid grant request: {0}")]
    InvalidRequest(String),

    #[error("Host call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Host transport error: {0}")]
    Transport(String),

    #[error("Host rejected credentials (status {0})")]
    Unauthorized(u16),

    #[error("Unexpected host response {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl ConnectorError {
    /// Whether a later attempt could succeed
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}
