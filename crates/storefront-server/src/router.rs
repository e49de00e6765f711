//! Route table

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    entitlement_status, health_check, link_identity, list_entitlements, stripe_webhook,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Payment provider
        .route("/webhook/stripe", post(stripe_webhook))
        // Buyer-facing fulfillment API
        .route("/api/entitlements/status", post(entitlement_status))
        .route("/api/identity", post(link_identity))
        .route("/api/buyers/{buyer_id}/entitlements", get(list_entitlements))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use storefront_core::{
        AccessGrantConnector, AccessStatus, CatalogItem, ConnectorConfig, FulfillmentConfig,
        FulfillmentOrchestrator, MemoryBuyerDirectory, MemoryEntitlementStore,
        MockRepositoryHost, SessionVerifier, StaticCatalog, StatusReport, WebhookIngress,
        WebhookVerifier,
    };

    use crate::handlers::EntitlementsResponse;

    const SECRET: &str = "whsec_router_test";
    const SESSION_SECRET: &str = "session_router_test";

    fn test_state(host: Arc<MockRepositoryHost>) -> AppState {
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
        let connector = AccessGrantConnector::new(
            host,
            ConnectorConfig {
                call_timeout: Duration::from_millis(200),
                cache_ttl: Duration::ZERO,
            },
        );
        let orchestrator = Arc::new(FulfillmentOrchestrator::new(
            Arc::new(MemoryEntitlementStore::new()),
            Arc::new(catalog),
            Arc::new(MemoryBuyerDirectory::new()),
            Arc::new(connector),
            FulfillmentConfig::default(),
        ));
        let webhook = WebhookIngress::new(WebhookVerifier::new(SECRET), orchestrator.clone());

        AppState {
            orchestrator,
            webhook: Some(Arc::new(webhook)),
            sessions: Some(Arc::new(SessionVerifier::new(SESSION_SECRET))),
        }
    }

    fn session(buyer: &str) -> String {
        SessionVerifier::new(SESSION_SECRET).issue(buyer).unwrap()
    }

    fn checkout_event() -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "payment_intent": "pi_123",
                "payment_status": "paid",
                "amount_total": 2400,
                "currency": "usd",
                "metadata": {"user_id": "u1", "skill_ids": "skillA,skillB"}
            }}
        })
        .to_string()
    }

    fn webhook_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/stripe")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn sign(body: &str) -> String {
        WebhookVerifier::new(SECRET)
            .sign(body.as_bytes(), chrono::Utc::now().timestamp())
            .unwrap()
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let resp = app
            .clone()
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn owned(app: &Router, buyer: &str) -> EntitlementsResponse {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/buyers/{buyer}/entitlements"))
                    .header("authorization", format!("Bearer {}", session(buyer)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_host() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["repository_host"], "MockHost");
        assert_eq!(json["webhook_configured"], true);
        assert_eq!(json["sessions_configured"], true);
    }

    #[tokio::test]
    async fn test_webhook_without_signature_is_400() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let resp = app
            .clone()
            .oneshot(webhook_request(&checkout_event(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(owned(&app, "u1").await.entitlements.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_with_bad_signature_is_400() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let resp = app
            .oneshot(webhook_request(
                &checkout_event(),
                Some("t=1700000000,v1=00ff".into()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_redelivered_webhook_is_200_without_new_rows() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let body = checkout_event();

        for expected in ["fulfilled", "duplicate", "duplicate"] {
            let resp = app
                .clone()
                .oneshot(webhook_request(&body, Some(sign(&body))))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(json["outcome"], expected);
        }

        assert_eq!(owned(&app, "u1").await.entitlements.len(), 2);
    }

    #[tokio::test]
    async fn test_identity_link_then_poll_until_accepted() {
        let host = Arc::new(MockRepositoryHost::new().with_repository("r-a"));
        let app = build_router(test_state(host.clone()));
        let body = checkout_event();
        app.clone()
            .oneshot(webhook_request(&body, Some(sign(&body))))
            .await
            .unwrap();

        let token = session("u1");
        let (status, bytes) = post_json(
            &app,
            "/api/identity",
            Some(&token),
            serde_json::json!({"github_username": "octocat"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let linked: EntitlementsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(linked.entitlements.len(), 1);
        assert_eq!(linked.entitlements[0].access, AccessStatus::Sent);

        let ids: Vec<_> = owned(&app, "u1")
            .await
            .entitlements
            .iter()
            .map(|e| e.id)
            .collect();
        let query = serde_json::json!({"entitlement_ids": ids});

        let (_, bytes) =
            post_json(&app, "/api/entitlements/status", Some(&token), query.clone()).await;
        let report: StatusReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report.statuses.len(), 2);
        assert!(!report.all_accepted);

        assert!(host.accept_invitation("r-a", "octocat"));

        let (status, bytes) =
            post_json(&app, "/api/entitlements/status", Some(&token), query).await;
        assert_eq!(status, StatusCode::OK);
        let report: StatusReport = serde_json::from_slice(&bytes).unwrap();
        let a = report
            .statuses
            .iter()
            .find(|s| s.item_id == "skillA")
            .unwrap();
        assert_eq!(a.access, AccessStatus::Accepted);
    }

    #[tokio::test]
    async fn test_buyer_api_requires_session() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let body = checkout_event();
        app.clone()
            .oneshot(webhook_request(&body, Some(sign(&body))))
            .await
            .unwrap();

        // The buyer named in the body no longer matters
        let link = serde_json::json!({"buyer_id": "u1", "github_username": "mallory"});
        let (status, _) = post_json(&app, "/api/identity", None, link.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let forged = SessionVerifier::new("not_the_secret").issue("u1").unwrap();
        let (status, _) = post_json(&app, "/api/identity", Some(&forged), link).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let query = serde_json::json!({"entitlement_ids": []});
        let (status, _) = post_json(&app, "/api/entitlements/status", None, query).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/buyers/u1/entitlements")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_buyer_cannot_read_another_buyers_entitlements() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let body = checkout_event();
        app.clone()
            .oneshot(webhook_request(&body, Some(sign(&body))))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/buyers/u1/entitlements")
                    .header("authorization", format!("Bearer {}", session("u2")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Another buyer's ids are left out and never count as accepted
        let ids: Vec<_> = owned(&app, "u1")
            .await
            .entitlements
            .iter()
            .map(|e| e.id)
            .collect();
        let token = session("u2");
        let query = serde_json::json!({"entitlement_ids": ids});
        let (status, bytes) =
            post_json(&app, "/api/entitlements/status", Some(&token), query).await;
        assert_eq!(status, StatusCode::OK);
        let report: StatusReport = serde_json::from_slice(&bytes).unwrap();
        assert!(report.statuses.is_empty());
        assert!(!report.all_accepted);
    }

    #[tokio::test]
    async fn test_relinking_a_different_username_is_409() {
        let host = Arc::new(MockRepositoryHost::new().with_repository("r-a"));
        let app = build_router(test_state(host));
        let token = session("u1");

        let (status, _) = post_json(
            &app,
            "/api/identity",
            Some(&token),
            serde_json::json!({"github_username": "octocat"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Same login again is fine
        let (status, _) = post_json(
            &app,
            "/api/identity",
            Some(&token),
            serde_json::json!({"github_username": "OctoCat"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, bytes) = post_json(
            &app,
            "/api/identity",
            Some(&token),
            serde_json::json!({"github_username": "mallory"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_identity_link_rejects_empty_username() {
        let app = build_router(test_state(Arc::new(MockRepositoryHost::new())));
        let token = session("u1");
        for username in ["", "../../orgs/acme"] {
            let (status, _) = post_json(
                &app,
                "/api/identity",
                Some(&token),
                serde_json::json!({"github_username": username}),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_webhook_disabled_without_secret() {
        let mut state = test_state(Arc::new(MockRepositoryHost::new()));
        state.webhook = None;
        let app = build_router(state);
        let body = checkout_event();
        let resp = app
            .oneshot(webhook_request(&body, Some(sign(&body))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_buyer_api_disabled_without_session_secret() {
        let mut state = test_state(Arc::new(MockRepositoryHost::new()));
        state.sessions = None;
        let app = build_router(state);
        let (status, _) = post_json(
            &app,
            "/api/identity",
            Some(&session("u1")),
            serde_json::json!({"github_username": "octocat"}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
