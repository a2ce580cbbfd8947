//! API endpoint integration tests

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;

mod common;
use common::{
    announce_device, api_state, setup_test_db, start_components, start_components_with, test_config,
};

/// Build a test API router with one device `d1` owned by `g1`
fn build_test_router(api_key: Option<&str>) -> axum::Router {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);
    tether_gateway::api::router(api_state(&db, &components, api_key))
}

fn as_principal(builder: axum::http::request::Builder, id: &str, group: &str) -> axum::http::request::Builder {
    builder
        .header("x-principal-id", id)
        .header("x-principal-group", group)
}

fn json_post(uri: &str, id: &str, group: &str, body: &str) -> Request<Body> {
    as_principal(Request::builder().method("POST").uri(uri), id, group)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(None);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let app = build_test_router(Some("test-api-key"));

    // Readiness stays open when an API key is configured
    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["checks"]["database"]["status"], "ok");
    assert_eq!(json["checks"]["leases"]["status"], "ok");
    assert_eq!(json["active_leases"], 0);
}

#[tokio::test]
async fn test_missing_identity_is_unauthenticated() {
    let app = build_test_router(None);

    let response = app
        .oneshot(Request::builder().uri("/api/devices").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "unauthenticated");
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let app = build_test_router(Some("test-api-key"));

    let response = app
        .clone()
        .oneshot(
            as_principal(Request::builder().uri("/api/devices"), "alice", "g1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            as_principal(Request::builder().uri("/api/devices"), "alice", "g1")
                .header("Authorization", "Bearer test-api-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_acquire_conflict_and_release() {
    let app = build_test_router(None);

    let response = app
        .clone()
        .oneshot(json_post("/api/devices/d1/acquire", "alice", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let lease = body_json(response).await;
    assert_eq!(lease["holder"], "alice");
    assert_eq!(lease["reconnected"], false);

    let response = app
        .clone()
        .oneshot(json_post("/api/devices/d1/acquire", "bob", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "conflict");

    let response = app
        .clone()
        .oneshot(json_post("/api/devices/d1/release", "alice", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "released");

    let response = app
        .oneshot(
            as_principal(Request::builder().uri("/api/devices/d1"), "bob", "g1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["device"]["state"], "available");
}

#[tokio::test]
async fn test_busy_device_times_out() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let mut config = test_config();
    config.lease.lock_timeout = Duration::from_millis(50);
    let components = start_components_with(&db, &config);
    let app = tether_gateway::api::router(api_state(&db, &components, None));

    let held = components.coordinator.table().lock("d1").await.unwrap();
    let response = app
        .clone()
        .oneshot(json_post("/api/devices/d1/acquire", "alice", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["code"], "timeout");

    drop(held);
    let response = app
        .oneshot(json_post("/api/devices/d1/acquire", "alice", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_outsider_is_denied() {
    let app = build_test_router(None);

    let response = app
        .oneshot(json_post("/api/devices/d1/acquire", "mallory", "g9", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "permission_denied");
}

#[tokio::test]
async fn test_status_hides_unreadable_devices() {
    let app = build_test_router(None);

    for uri in ["/api/devices/d1", "/api/devices/nope"] {
        let response = app
            .clone()
            .oneshot(
                as_principal(Request::builder().uri(uri), "mallory", "g9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }
}

#[tokio::test]
async fn test_unknown_device_is_not_found() {
    let app = build_test_router(None);

    let response = app
        .oneshot(json_post("/api/devices/nope/acquire", "alice", "g1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "not_found");
}

#[tokio::test]
async fn test_inverted_reservation_is_rejected() {
    let app = build_test_router(None);

    let body = r#"{
        "device_id": "d1",
        "start": "2030-01-01T12:00:00Z",
        "end": "2030-01-01T11:00:00Z"
    }"#;
    let response = app
        .oneshot(json_post("/api/reservations", "alice", "g1", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "validation_error");
}

#[tokio::test]
async fn test_reservation_workflow() {
    let app = build_test_router(None);

    let body = r#"{
        "device_id": "d1",
        "start": "2030-01-01T10:00:00Z",
        "end": "2030-01-01T11:00:00Z",
        "remarks": "firmware flashing"
    }"#;
    let response = app
        .clone()
        .oneshot(json_post("/api/reservations", "alice", "g1", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let reservation = body_json(response).await;
    assert_eq!(reservation["status"], "pending");
    let id = reservation["id"].as_str().unwrap().to_string();

    // Group members may use but not approve
    let response = app
        .clone()
        .oneshot(json_post(
            &format!("/api/reservations/{id}/decision"),
            "bob",
            "g1",
            r#"{"approve": true}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let approve = as_principal(
        Request::builder()
            .method("POST")
            .uri(format!("/api/reservations/{id}/decision")),
        "root",
        "ops",
    )
    .header("x-principal-admin", "true")
    .header("content-type", "application/json")
    .body(Body::from(r#"{"approve": true}"#))
    .unwrap();
    let response = app.clone().oneshot(approve).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "approved");

    let response = app
        .oneshot(json_post(
            &format!("/api/reservations/{id}/cancel"),
            "alice",
            "g1",
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_node_registration_and_heartbeat() {
    let app = build_test_router(None);

    let body = r#"{
        "name": "lab-agent",
        "host": "10.0.0.7",
        "port": 7575,
        "devices": [{"id": "d2", "display_name": "Scope", "owning_group": "g2"}]
    }"#;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/nodes")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let registered = body_json(response).await;
    let node_id = registered["node"]["id"].as_str().unwrap().to_string();
    assert_eq!(registered["devices"][0]["id"], "d2");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/nodes/{node_id}/heartbeat"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["restored"], 0);
}
