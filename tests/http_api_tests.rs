//! HTTP surface tests: envelope shape, CRUD, search, comments, context.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use lm_assist::config::{AssistConfig, MachineIdentity};
use lm_assist::knowledge::{KnowledgeGenerator, KnowledgeStore};
use lm_assist::pricing::RateTable;
use lm_assist::retrieval::context::ContextSuggester;
use lm_assist::retrieval::RetrievalEngine;
use lm_assist::server::{build_router, ServerState};
use lm_assist::session::SessionCache;
use lm_assist::vector::{HashEmbedder, VectorStore};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn test_state(root: &TempDir) -> ServerState {
    let data_dir = root.path().join("data");
    let transcript_root = root.path().join("claude");
    std::fs::create_dir_all(transcript_root.join("projects")).unwrap();

    let config = AssistConfig {
        data_dir: data_dir.clone(),
        transcript_root,
        hub_url: None,
        hub_api_key: None,
        port: 0,
    };

    let sessions = Arc::new(SessionCache::new(RateTable::default()));
    let knowledge = Arc::new(
        KnowledgeStore::open(config.knowledge_dir()).await.unwrap(),
    );
    let mut vectors = VectorStore::new(config.lance_dir(), Arc::new(HashEmbedder));
    vectors.initialize().await.unwrap();
    let vectors = Arc::new(vectors);

    let engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&vectors),
        Arc::clone(&knowledge),
    ));
    let suggester = Arc::new(ContextSuggester::new(
        Arc::clone(&engine),
        Arc::clone(&vectors),
        Arc::clone(&sessions),
        config.settings_path(),
        config.projects_dir(),
    ));
    let generator = Arc::new(KnowledgeGenerator::new(
        Arc::clone(&knowledge),
        Arc::clone(&sessions),
        Vec::new(),
    ));

    ServerState {
        config,
        identity: MachineIdentity {
            machine_id: "test-machine".to_string(),
            machine_hostname: "test".to_string(),
            machine_os: "linux".to_string(),
        },
        sessions,
        knowledge,
        vectors,
        engine,
        suggester,
        generator,
        sync: None,
        shutdown: Arc::new(AtomicBool::new(false)),
    }
}

async fn call(router: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn create_body(title: &str) -> Value {
    json!({
        "title": title,
        "type": "schema",
        "project": "/work/repo",
        "parts": [
            {"title": "Layout", "summary": "Tables and columns explained.", "content": "Long form."}
        ]
    })
}

#[tokio::test]
async fn test_create_get_delete_round_trip() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, body) = call(&router, "POST", "/knowledge", Some(create_body("Schema notes"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(id.starts_with('K'));
    assert_eq!(body["data"]["parts"][0]["partId"], format!("{}.1", id));

    let (status, body) = call(&router, "GET", &format!("/knowledge/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "Schema notes");

    let (status, body) = call(
        &router,
        "GET",
        &format!("/knowledge/{}/parts/{}.1", id, id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["title"], "Layout");

    let (status, _) = call(&router, "DELETE", &format!("/knowledge/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&router, "GET", &format!("/knowledge/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_create_from_markdown_body() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let markdown = "---\nid: K009\ntitle: \"Imported doc\"\ntype: flow\nproject: /p\nstatus: active\ncreatedAt: 2026-01-01T00:00:00.000Z\nupdatedAt: 2026-01-01T00:00:00.000Z\n---\n\n# K009: Imported doc\n\n## K009.1: Only part\nA summary paragraph.\n";
    let (status, body) = call(
        &router,
        "POST",
        "/knowledge",
        Some(json!({"markdown": markdown})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "K009");
    assert_eq!(body["data"]["type"], "flow");
}

#[tokio::test]
async fn test_duplicate_create_is_conflict() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let mut body = create_body("Dup");
    body["sourceAgentId"] = json!("agent-z");
    let (status, _) = call(&router, "POST", "/knowledge", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);

    body["title"] = json!("Different");
    let (status, reply) = call(&router, "POST", "/knowledge", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(reply["error"]["code"], "duplicate");
    // The existing document's id is surfaced in the message.
    assert!(reply["error"]["message"].as_str().unwrap().contains("K001"));
}

#[tokio::test]
async fn test_update_bumps_and_renumbers() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (_, created) = call(&router, "POST", "/knowledge", Some(create_body("Mutable"))).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();
    let before = created["data"]["updatedAt"].as_str().unwrap().to_string();

    let patch = json!({"parts": [
        {"title": "A", "summary": "a"},
        {"title": "B", "summary": "b"}
    ]});
    let (status, updated) = call(&router, "PUT", &format!("/knowledge/{}", id), Some(patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["data"]["parts"][1]["partId"], format!("{}.2", id));

    let parse = |raw: &str| chrono::DateTime::parse_from_rfc3339(raw).unwrap();
    let after = updated["data"]["updatedAt"].as_str().unwrap().to_string();
    assert!(parse(&after) > parse(&before));
}

#[tokio::test]
async fn test_search_endpoint_requires_query() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, _) = call(&router, "GET", "/knowledge/search?query=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&router, "GET", "/knowledge/search?query=anything&limit=3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn test_comment_endpoints() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (_, created) = call(&router, "POST", "/knowledge", Some(create_body("Commented"))).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let comment = json!({
        "type": "expand",
        "content": "Needs a concrete example.",
        "source": "reviewer",
        "partId": format!("{}.1", id)
    });
    let (status, body) = call(
        &router,
        "POST",
        &format!("/knowledge/{}/comments", id),
        Some(comment),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "not_addressed");

    let (status, body) = call(
        &router,
        "POST",
        &format!("/knowledge/{}/comments/1/address", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "addressed");

    let (_, body) = call(&router, "GET", &format!("/knowledge/{}/comments", id), None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_sync_unconfigured_is_invalid_request() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, body) = call(
        &router,
        "POST",
        "/knowledge/remote-sync",
        Some(json!({"project": "/work/repo"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_generate_status_and_stop() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, body) = call(&router, "GET", "/knowledge/generate/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], false);

    let (status, _) = call(&router, "POST", "/knowledge/generate/stop", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_context_suggest_empty_store() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, body) = call(
        &router,
        "POST",
        "/context/suggest",
        Some(json!({"prompt": "how does the scheduler work"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["context"], "");
    assert_eq!(body["data"]["tokens"], 0);
}

#[tokio::test]
async fn test_health_endpoint() {
    let root = TempDir::new().unwrap();
    let router = build_router(test_state(&root).await);

    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["machineId"], "test-machine");
}
