//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};

use storefront_core::{Entitlement, FulfillmentError, StatusQuery, StatusReport, WebhookOutcome};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub repository_host: String,
    pub webhook_configured: bool,
    pub sessions_configured: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkIdentityRequest {
    pub github_username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntitlementsResponse {
    pub entitlements: Vec<Entitlement>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

fn from_fulfillment(err: &FulfillmentError) -> ApiError {
    let (status, code) = match err {
        FulfillmentError::WebhookSignature(_) => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
        FulfillmentError::WebhookParse(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
        FulfillmentError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        FulfillmentError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
        FulfillmentError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        FulfillmentError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "FULFILLMENT_ERROR"),
    };
    api_error(status, code, err.user_message())
}

/// Buyer named by the `Authorization: Bearer` session token
fn authenticated_buyer(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let sessions = state.sessions.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "SESSIONS_DISABLED",
            "Session secret not configured",
        )
    })?;

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            api_error(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "Missing bearer token")
        })?;

    sessions.verify(token.trim()).map_err(|e| {
        tracing::warn!("Session rejected: {}", e);
        from_fulfillment(&e)
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        repository_host: state.orchestrator.connector().host_name().to_string(),
        webhook_configured: state.webhook.is_some(),
        sessions_configured: state.sessions.is_some(),
    })
}

/// Stripe webhook handler
///
/// 400 for signature and payload problems, 200 for everything the ingress
/// accepted, including duplicates and events it chose to ignore.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let ingress = state.webhook.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "WEBHOOK_DISABLED",
            "Webhook secret not configured",
        )
    })?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    let outcome = ingress.receive(&body, signature).await.map_err(|e| {
        if matches!(e, FulfillmentError::WebhookSignature(_)) {
            tracing::warn!("Webhook signature failed: {}", e);
        } else {
            tracing::error!("Webhook processing error: {}", e);
        }
        from_fulfillment(&e)
    })?;

    Ok(Json(outcome))
}

/// Access status of the buyer's entitlements (polled by the success page)
///
/// Ids the session's buyer does not own are left out of the answer and
/// keep `all_accepted` false.
pub async fn entitlement_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<StatusQuery>,
) -> Result<Json<StatusReport>, ApiError> {
    let buyer_id = authenticated_buyer(&state, &headers)?;

    let statuses = state
        .orchestrator
        .access_statuses(&buyer_id, &query.entitlement_ids)
        .await
        .map_err(|e| {
            tracing::error!("Status query failed: {}", e);
            from_fulfillment(&e)
        })?;

    Ok(Json(StatusReport::new(&query.entitlement_ids, statuses)))
}

/// Link the buyer's GitHub username and send any invitations waiting on it
///
/// 409 if the buyer already has a different username linked.
pub async fn link_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LinkIdentityRequest>,
) -> Result<Json<EntitlementsResponse>, ApiError> {
    let buyer_id = authenticated_buyer(&state, &headers)?;

    let entitlements = state
        .orchestrator
        .link_identity(&buyer_id, &payload.github_username)
        .await
        .map_err(|e| {
            tracing::warn!("Identity link failed: {}", e);
            from_fulfillment(&e)
        })?;

    Ok(Json(EntitlementsResponse { entitlements }))
}

/// Everything the buyer owns. Only the buyer's own session may list it.
pub async fn list_entitlements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(buyer_id): Path<String>,
) -> Result<Json<EntitlementsResponse>, ApiError> {
    if authenticated_buyer(&state, &headers)? != buyer_id {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "Entitlements belong to another buyer",
        ));
    }

    let entitlements = state
        .orchestrator
        .entitlements_for(&buyer_id)
        .map_err(|e| from_fulfillment(&e))?;

    Ok(Json(EntitlementsResponse { entitlements }))
}
