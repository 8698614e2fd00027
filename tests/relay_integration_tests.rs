//! Relay handler against a live in-process upstream.

use axum::routing::get;
use axum::{Json, Router};
use lm_assist::relay::{RelayHandler, ServiceRoute};
use serde_json::json;

/// Spin up a minimal upstream standing in for the local HTTP surface.
async fn spawn_upstream() -> u16 {
    let app = Router::new()
        .route(
            "/knowledge",
            get(|| async { Json(json!({"success": true, "data": []})) }),
        )
        .route("/style.css", get(|| async { "body { margin: 0 }" }))
        .route("/stripped", get(|| async { Json(json!({"stripped": true})) }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_allow_listed_path_is_forwarded() {
    let port = spawn_upstream().await;
    let handler = RelayHandler::new(port, vec![]);

    let reply = handler
        .handle_frame(&json!({
            "type": "api_relay",
            "requestId": "req-1",
            "method": "GET",
            "path": "/knowledge"
        }))
        .await
        .unwrap();

    assert_eq!(reply["type"], "api_relay_response");
    assert_eq!(reply["requestId"], "req-1");
    assert_eq!(reply["status"], 200);
    assert_eq!(reply["encoding"], "json");
    assert_eq!(reply["data"]["success"], true);
}

#[tokio::test]
async fn test_static_asset_is_forwarded_as_text() {
    let port = spawn_upstream().await;
    let handler = RelayHandler::new(port, vec![]);

    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-2",
            "method": "GET",
            "path": "/style.css"
        }))
        .await
        .unwrap();

    assert_eq!(reply["status"], 200);
    assert_eq!(reply["encoding"], "utf8");
    assert!(reply["data"].as_str().unwrap().contains("margin"));
}

#[tokio::test]
async fn test_outside_allow_list_rejected_400() {
    let port = spawn_upstream().await;
    let handler = RelayHandler::new(port, vec![]);

    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-3",
            "method": "GET",
            "path": "/etc/passwd"
        }))
        .await
        .unwrap();
    assert_eq!(reply["status"], 400);

    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-4",
            "method": "GET",
            "path": "/knowledge/../secrets"
        }))
        .await
        .unwrap();
    assert_eq!(reply["status"], 400);
}

#[tokio::test]
async fn test_service_route_strips_prefix() {
    let port = spawn_upstream().await;
    let handler = RelayHandler::new(
        port,
        vec![ServiceRoute {
            prefix: "/svc".to_string(),
            target: format!("http://127.0.0.1:{}", port),
            strip_prefix: true,
        }],
    );

    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-5",
            "method": "GET",
            "path": "/svc/stripped"
        }))
        .await
        .unwrap();

    assert_eq!(reply["status"], 200);
    assert_eq!(reply["data"]["stripped"], true);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    // Nothing listens on this port.
    let handler = RelayHandler::new(1, vec![]);
    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-6",
            "method": "GET",
            "path": "/knowledge"
        }))
        .await
        .unwrap();
    assert_eq!(reply["status"], 502);
}

#[tokio::test]
async fn test_query_string_preserved() {
    let port = spawn_upstream().await;
    let handler = RelayHandler::new(port, vec![]);

    let reply = handler
        .handle_frame(&json!({
            "requestId": "req-7",
            "method": "GET",
            "path": "/knowledge",
            "query": "status=active&origin=local"
        }))
        .await
        .unwrap();
    // The upstream ignores the query; reaching it at all proves the URL
    // stayed well-formed.
    assert_eq!(reply["status"], 200);
}
