//! E2E tests for the signed sink webhook

mod common;

use common::TestServer;
use serde_json::{Value, json};

async fn post_signed(server: &TestServer, payload: &[u8]) -> reqwest::Response {
    server
        .client
        .post(server.url("/webhook"))
        .header("Content-Type", "application/json")
        .header("X-Feedbridge-Signature", server.sign(payload))
        .body(payload.to_vec())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_signed_link_created_registers_link() {
    let server = TestServer::new().await;

    let payload = serde_json::to_vec(&json!({
        "event": "link.created",
        "sink_id": 10,
        "source_handle": "alice",
        "delivery_token": "tok-from-webhook",
        "callback_endpoint": server.sink_endpoint,
    }))
    .unwrap();

    let response = post_signed(&server, &payload).await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["links_affected"], 1);

    let response = server
        .client
        .get(server.url("/api/v1/links/alice"))
        .header("Authorization", server.bearer())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["link"]["sink_id"], 10);
}

#[tokio::test]
async fn test_unsigned_webhook_is_rejected() {
    let server = TestServer::new().await;

    let payload = serde_json::to_vec(&json!({
        "event": "link.created",
        "sink_id": 10,
        "source_handle": "mallory",
        "delivery_token": "tok-evil",
        "callback_endpoint": server.sink_endpoint,
    }))
    .unwrap();

    let response = server
        .client
        .post(server.url("/webhook"))
        .header("Content-Type", "application/json")
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    // Nothing was registered
    let response = server
        .client
        .get(server.url("/api/v1/links/mallory"))
        .header("Authorization", server.bearer())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_tampered_payload_is_rejected() {
    let server = TestServer::new().await;

    let signed = serde_json::to_vec(&json!({
        "event": "link.removed",
        "sink_id": 1,
    }))
    .unwrap();
    let tampered = serde_json::to_vec(&json!({
        "event": "link.removed",
        "sink_id": 2,
    }))
    .unwrap();

    let response = server
        .client
        .post(server.url("/webhook"))
        .header("Content-Type", "application/json")
        .header("X-Feedbridge-Signature", server.sign(&signed))
        .body(tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_link_removed_revokes_by_sink_id() {
    let server = TestServer::new().await;
    server.link_account("alice", 7, "tok-alice").await;

    let payload = serde_json::to_vec(&json!({
        "event": "link.removed",
        "sink_id": 7,
    }))
    .unwrap();

    let response = post_signed(&server, &payload).await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["links_affected"], 1);

    let response = server
        .client
        .get(server.url("/api/v1/links/alice"))
        .header("Authorization", server.bearer())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_token_rotation_applies_to_next_delivery() {
    let server = TestServer::new().await;
    server.link_account("alice", 1, "tok-old").await;

    let payload = serde_json::to_vec(&json!({
        "event": "token.rotated",
        "sink_id": 1,
        "delivery_token": "tok-new",
        "callback_endpoint": server.sink_endpoint,
    }))
    .unwrap();

    let response = post_signed(&server, &payload).await;
    assert_eq!(response.status(), 200);

    server
        .source
        .add_activity(
            "alice",
            json!({
                "id": 1,
                "type": "vote",
                "date": chrono::Utc::now().to_rfc3339(),
                "msg": "@carol voted on your post",
                "url": "@alice/my-post",
            }),
        )
        .await;

    let response = server
        .client
        .post(server.url("/api/v1/relay/trigger"))
        .header("Authorization", server.bearer())
        .json(&json!({ "source_handle": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = server.sink.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["tokens"], json!(["tok-new"]));
}

#[tokio::test]
async fn test_notifications_toggle_by_sink_id() {
    let server = TestServer::new().await;
    server.link_account("alice", 3, "tok-alice").await;

    let disable = serde_json::to_vec(&json!({
        "event": "notifications.disabled",
        "sink_id": 3,
    }))
    .unwrap();
    let response = post_signed(&server, &disable).await;
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url("/api/v1/links/alice"))
        .header("Authorization", server.bearer())
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["link"]["notifications_enabled"], false);

    let enable = serde_json::to_vec(&json!({
        "event": "notifications.enabled",
        "sink_id": 3,
    }))
    .unwrap();
    let response = post_signed(&server, &enable).await;
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url("/api/v1/links/alice"))
        .header("Authorization", server.bearer())
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["link"]["notifications_enabled"], true);
}

#[tokio::test]
async fn test_signed_but_malformed_payload_is_400() {
    let server = TestServer::new().await;

    // Valid signature over an event the relay does not know
    let payload = serde_json::to_vec(&json!({
        "event": "link.exploded",
        "sink_id": 1,
    }))
    .unwrap();

    let response = post_signed(&server, &payload).await;
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}
