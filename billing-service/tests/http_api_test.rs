//! HTTP surface integration tests for billing-service.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use billing_service::handlers::{USER_ID_HEADER, USER_ROLE_HEADER};
use billing_service::startup::router;
use common::TestHarness;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn request(method: Method, uri: &str, user_id: Uuid, role: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_ID_HEADER, user_id.to_string())
        .header(USER_ROLE_HEADER, role);
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn request_counters_are_exported_on_metrics() {
    let h = TestHarness::new();
    let app = router(h.app_state());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(body.contains("http_requests_total{"));
    assert!(body.contains("route=\"/health\""));
}

#[tokio::test]
async fn synced_customer_can_start_card_setup() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let user_id = Uuid::new_v4();
    let manager_id = Uuid::new_v4();
    let uri = format!("/api/manager/clients/{}", user_id);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/client/payment-methods/setup-intent",
            user_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            &uri,
            manager_id,
            "manager",
            Some(json!({ "email": "grace@client.test", "full_name": "Grace Client" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "grace@client.test");
    assert!(body["external_customer_id"].is_null());

    let (status, intent) = send(
        &app,
        request(
            Method::POST,
            "/api/client/payment-methods/setup-intent",
            user_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(intent["client_secret"].is_string());

    let (status, body) = send(
        &app,
        request(
            Method::PUT,
            &uri,
            manager_id,
            "manager",
            Some(json!({ "email": "grace@new.test" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "grace@new.test");
    assert!(body["external_customer_id"].is_string());

    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            &uri,
            manager_id,
            "manager",
            Some(json!({ "email": "not-an-email" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manager_activation_then_client_views_billing() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;
    let manager_id = Uuid::new_v4();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/manager/clients/{}/subscription/activate", client_id),
            manager_id,
            "manager",
            Some(json!({ "plan": "starter" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["balance_id"].is_string());

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/client/subscription", client_id, "client", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["plan"], "starter");
    assert_eq!(body["subscription"]["monthly_hours"], 200);

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/client/billing/summary", client_id, "client", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_failed"], 0);
    assert_eq!(body["recent_invoices"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/client/hours/balance", client_id, "client", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"]["allocated_hours"], 200);
}

#[tokio::test]
async fn client_routes_reject_other_roles() {
    let h = TestHarness::new();
    let app = router(h.app_state());

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/client/invoices", Uuid::new_v4(), "manager", None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/manager/subscriptions/{}/pause", Uuid::new_v4()),
            Uuid::new_v4(),
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_caller_is_unauthorized() {
    let h = TestHarness::new();
    let app = router(h.app_state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/client/invoices")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn billing_errors_render_code_and_status() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/manager/clients/{}/subscription/activate", client_id),
            Uuid::new_v4(),
            "admin",
            Some(json!({ "plan": "enterprise" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "enterprise_requires_custom_price");

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            &format!("/api/client/invoices/{}", Uuid::new_v4()),
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "invoice_not_found");

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/api/client/invoices?status=refunded",
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn purchase_and_pay_extra_hours() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;

    let (status, invoice) = send(
        &app,
        request(
            Method::POST,
            "/api/client/hours/purchase",
            client_id,
            "client",
            Some(json!({ "hours": 4 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(invoice["total"], 30_000);
    assert_eq!(invoice["status"], "unpaid");

    let (status, paid) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/manager/invoices/{}/pay", invoice["invoice_id"].as_str().unwrap()),
            Uuid::new_v4(),
            "manager",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["status"], "paid");

    let (status, history) = send(
        &app,
        request(Method::GET, "/api/client/payments/history", client_id, "client", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn purchase_validates_hours() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/client/hours/purchase",
            client_id,
            "client",
            Some(json!({ "hours": 0 })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn time_log_updates_balance_and_usage_report() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .activate_subscription(client_id, "starter", None)
        .await
        .unwrap();
    let project_id = Uuid::new_v4();

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/manager/time-logs",
            Uuid::new_v4(),
            "manager",
            Some(json!({
                "client_id": client_id,
                "project_id": project_id,
                "project_title": "Mobile App",
                "duration_minutes": 90,
                "start_time": "2026-03-15T09:00:00Z"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["time_log"]["duration_minutes"], 90);
    assert!(body["balance"].is_object());

    let (status, usage) = send(
        &app,
        request(Method::GET, "/api/client/hours/usage", client_id, "client", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let usage = usage.as_array().unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0]["total_minutes"], 90);
    assert_eq!(usage[0]["project_title"], "Mobile App");
}

#[tokio::test]
async fn notifications_can_be_listed_and_read() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, _) = h.seed_client().await;
    h.services
        .orchestrator
        .purchase_extra_hours(client_id, 1, None)
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/api/client/notifications/unread-count",
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unread"], 1);

    let (_, list) = send(
        &app,
        request(
            Method::GET,
            "/api/client/notifications?unread_only=true",
            client_id,
            "client",
            None,
        ),
    )
    .await;
    let notification_id = list[0]["notification_id"].as_str().unwrap().to_string();
    assert_eq!(list[0]["title"], "Extra Hours Invoice");

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!("/api/client/notifications/{}/read", notification_id),
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(
        &app,
        request(
            Method::POST,
            "/api/client/notifications/read-all",
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(body["updated"], 0);
}

#[tokio::test]
async fn payment_method_lifecycle_over_http() {
    let h = TestHarness::new();
    let app = router(h.app_state());
    let (client_id, original) = h.seed_client().await;

    let (status, intent) = send(
        &app,
        request(
            Method::POST,
            "/api/client/payment-methods/setup-intent",
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let setup_intent_id = intent["setup_intent_id"].as_str().unwrap().to_string();
    h.gateway.complete_setup_intent(
        &setup_intent_id,
        "pm_http_card",
        billing_service::services::gateway::CardDetails {
            brand: Some("mastercard".to_string()),
            last_four: Some("4444".to_string()),
            exp_month: Some(1),
            exp_year: Some(2032),
        },
    );

    let (status, method) = send(
        &app,
        request(
            Method::POST,
            "/api/client/payment-methods/confirm",
            client_id,
            "client",
            Some(json!({ "setup_intent_id": setup_intent_id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(method["card_brand"], "MASTERCARD");
    assert_eq!(method["is_default"], true);

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            &format!(
                "/api/client/payment-methods/{}/default",
                original.payment_method_id
            ),
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        request(
            Method::DELETE,
            &format!(
                "/api/client/payment-methods/{}",
                method["payment_method_id"].as_str().unwrap()
            ),
            client_id,
            "client",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, methods) = send(
        &app,
        request(Method::GET, "/api/client/payment-methods", client_id, "client", None),
    )
    .await;
    assert_eq!(methods.as_array().unwrap().len(), 1);
}
