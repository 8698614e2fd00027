//! Remote sync against a fake hub: new entries mirrored, vanished entries
//! flagged stale, self skipped, sync loop protected by the origin filter.

use axum::extract::Path as AxumPath;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use lm_assist::config::MachineIdentity;
use lm_assist::knowledge::models::IndexEntry;
use lm_assist::knowledge::{
    Knowledge, KnowledgePart, KnowledgeStatus, KnowledgeStore, KnowledgeType, ListFilter,
    RemoteOrigin,
};
use lm_assist::sync::{HubClient, RemoteSyncService, SyncState};
use lm_assist::vector::{HashEmbedder, VectorStore};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PEER: &str = "peer-1";
const SHARED_REMOTE: &str = "github.com/acme/widgets";

fn peer_doc(id: &str, title: &str) -> Knowledge {
    // Fixed instants so repeated passes see an unchanged peer document.
    let base = chrono::DateTime::parse_from_rfc3339("2026-07-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let mut doc = Knowledge {
        id: id.to_string(),
        title: title.to_string(),
        knowledge_type: KnowledgeType::Wiring,
        project: "/peer/work/widgets".to_string(),
        status: KnowledgeStatus::Active,
        created_at: base - Duration::hours(2),
        updated_at: base - Duration::hours(1),
        source_session_id: None,
        source_agent_id: None,
        source_timestamp: None,
        parts: vec![KnowledgePart {
            part_id: String::new(),
            title: "Part".to_string(),
            summary: "Summary from the peer.".to_string(),
            content: "Content from the peer.".to_string(),
        }],
        origin: None,
    };
    doc.renumber_parts();
    doc
}

/// Fake hub: one peer machine advertising one project and one document.
async fn spawn_hub(self_machine: &str) -> u16 {
    let self_machine = self_machine.to_string();

    let machines = move || {
        let me = self_machine.clone();
        async move {
            Json(json!({
                "success": true,
                "data": [
                    {"machineId": me, "hostname": "here", "os": "linux", "connected": true},
                    {"machineId": PEER, "hostname": "peer-host", "os": "macos", "connected": true},
                ]
            }))
        }
    };

    let projects = |AxumPath(_machine): AxumPath<String>| async {
        Json(json!({
            "success": true,
            "data": [{"project": "/peer/work/widgets", "remotes": [SHARED_REMOTE]}]
        }))
    };

    let knowledge_list = |AxumPath(_machine): AxumPath<String>| async {
        let entry = IndexEntry::from_knowledge(&peer_doc("K011", "Fresh peer doc"));
        Json(json!({"success": true, "data": [entry]}))
    };

    let knowledge_doc = |AxumPath((_machine, id)): AxumPath<(String, String)>| async move {
        if id == "K011" {
            Json(json!({"success": true, "data": peer_doc("K011", "Fresh peer doc")}))
        } else {
            Json(json!({"success": false, "error": "not found"}))
        }
    };

    let app = Router::new()
        .route("/api/machines", get(machines))
        .route("/api/machines/:machine/relay/projects", get(projects))
        .route("/api/machines/:machine/relay/knowledge", get(knowledge_list))
        .route(
            "/api/machines/:machine/relay/knowledge/:id",
            get(knowledge_doc),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn init_git_project(dir: &Path) {
    let run = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .current_dir(dir)
            .args(args)
            .status()
            .expect("git available");
        assert!(status.success(), "git {:?} failed", args);
    };
    run(&["init", "-q"]);
    run(&["remote", "add", "origin", "git@github.com:Acme/Widgets.git"]);
}

#[tokio::test]
async fn test_sync_mirrors_new_and_flags_stale() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("widgets");
    std::fs::create_dir_all(&project).unwrap();
    init_git_project(&project);

    let store = Arc::new(
        KnowledgeStore::open(root.path().join("knowledge"))
            .await
            .unwrap(),
    );
    let mut vectors = VectorStore::new(root.path().join("lance-store"), Arc::new(HashEmbedder));
    vectors.initialize().await.unwrap();
    let vectors = Arc::new(vectors);

    // We already hold K010 from this peer; the peer no longer advertises it.
    let mut stale = peer_doc("K010", "Vanished peer doc");
    stale.origin = Some(RemoteOrigin {
        machine_id: PEER.to_string(),
        machine_hostname: "peer-host".to_string(),
        machine_os: "macos".to_string(),
    });
    store.store_remote(stale).await.unwrap();

    let identity = MachineIdentity {
        machine_id: "self-m".to_string(),
        machine_hostname: "here".to_string(),
        machine_os: "linux".to_string(),
    };
    let hub_port = spawn_hub(&identity.machine_id).await;
    let hub = Arc::new(
        HubClient::new(format!("http://127.0.0.1:{}", hub_port), "key".to_string()).unwrap(),
    );

    let service = Arc::new(RemoteSyncService::new(
        hub,
        Arc::clone(&store),
        Arc::clone(&vectors),
        identity,
        &root.path().join("knowledge"),
    ));

    service.start(project).unwrap();
    let status = wait_for_completion(&service).await;

    assert_eq!(status.status, SyncState::Done, "errors: {:?}", status.errors);
    assert_eq!(status.entries_synced, 1);
    assert_eq!(status.entries_flagged_stale, 1);
    assert_eq!(status.peers_checked, 1, "self must be skipped");

    // K011 arrived under remote/{peer}/ with origin stamped.
    let fresh = store.get("K011", Some(PEER)).await.expect("K011 synced");
    assert_eq!(
        fresh.origin.as_ref().map(|o| o.machine_id.as_str()),
        Some(PEER)
    );
    assert_eq!(fresh.parts[0].part_id, "K011.1");

    // K010 still exists on disk but is archived.
    let stale = store.get("K010", Some(PEER)).await.expect("K010 kept");
    assert_eq!(stale.status, KnowledgeStatus::Archived);

    // Both discoverable through the remote-origin listing.
    let remote = store
        .list(&ListFilter {
            origin: Some("remote".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(remote.len(), 2);

    // And the new doc's vectors landed.
    assert!(vectors
        .has_knowledge(&format!("{}:K011", PEER))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_second_pass_skips_up_to_date_entries() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("widgets");
    std::fs::create_dir_all(&project).unwrap();
    init_git_project(&project);

    let store = Arc::new(
        KnowledgeStore::open(root.path().join("knowledge"))
            .await
            .unwrap(),
    );
    let mut vectors = VectorStore::new(root.path().join("lance-store"), Arc::new(HashEmbedder));
    vectors.initialize().await.unwrap();
    let vectors = Arc::new(vectors);

    let identity = MachineIdentity {
        machine_id: "self-m".to_string(),
        machine_hostname: "here".to_string(),
        machine_os: "linux".to_string(),
    };
    let hub_port = spawn_hub(&identity.machine_id).await;
    let hub = Arc::new(
        HubClient::new(format!("http://127.0.0.1:{}", hub_port), "key".to_string()).unwrap(),
    );
    let service = Arc::new(RemoteSyncService::new(
        hub,
        Arc::clone(&store),
        Arc::clone(&vectors),
        identity,
        &root.path().join("knowledge"),
    ));

    service.start(project.clone()).unwrap();
    let first = wait_for_completion(&service).await;
    assert_eq!(first.entries_synced, 1);

    service.start(project).unwrap();
    let second = wait_for_completion(&service).await;
    assert_eq!(second.entries_synced, 0);
    assert_eq!(second.entries_skipped, 1);

    // The remote count never grows past what the peer advertises.
    assert_eq!(store.get_remote_knowledge_ids(PEER).await.len(), 1);
}

async fn wait_for_completion(service: &Arc<RemoteSyncService>) -> lm_assist::sync::SyncStatus {
    for _ in 0..300 {
        let status = service.status();
        if status.status != SyncState::Running {
            return status;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("sync did not finish in time");
}
