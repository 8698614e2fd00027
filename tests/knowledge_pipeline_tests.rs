//! End-to-end pipeline tests: transcript -> generator -> index -> search.

use lm_assist::knowledge::{KnowledgeGenerator, KnowledgeStore};
use lm_assist::pricing::RateTable;
use lm_assist::retrieval::RetrievalEngine;
use lm_assist::session::SessionCache;
use lm_assist::vector::{indexer, HashEmbedder, VectorStore};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Pipeline {
    _root: TempDir,
    sessions: Arc<SessionCache>,
    store: Arc<KnowledgeStore>,
    vectors: Arc<VectorStore>,
    generator: KnowledgeGenerator,
    engine: RetrievalEngine,
    project_dir: std::path::PathBuf,
}

async fn pipeline() -> Pipeline {
    let root = TempDir::new().unwrap();
    let project_dir = root.path().join("projects").join("encoded-project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let sessions = Arc::new(SessionCache::new(RateTable::default()));
    let store = Arc::new(
        KnowledgeStore::open(root.path().join("knowledge"))
            .await
            .unwrap(),
    );

    let mut vectors = VectorStore::new(root.path().join("lance-store"), Arc::new(HashEmbedder));
    vectors.initialize().await.unwrap();
    let vectors = Arc::new(vectors);

    let generator =
        KnowledgeGenerator::new(Arc::clone(&store), Arc::clone(&sessions), Vec::new());
    let engine = RetrievalEngine::new(Arc::clone(&vectors), Arc::clone(&store));

    Pipeline {
        _root: root,
        sessions,
        store,
        vectors,
        generator,
        engine,
        project_dir,
    }
}

fn write_explore_session(project_dir: &Path, session_id: &str, agent_id: &str, result: &str) {
    let parent = project_dir.join(format!("{}.jsonl", session_id));
    let mut file = std::fs::File::create(&parent).unwrap();
    let launch = serde_json::json!({
        "type": "assistant",
        "message": {"content": [{
            "type": "tool_use",
            "name": "Task",
            "input": {
                "description": "",
                "prompt": "Research how the scheduler handles preemption",
                "subagent_type": "Explore"
            }
        }]},
        "timestamp": "2026-01-01T10:00:00Z"
    });
    writeln!(file, "{}", launch).unwrap();

    let subagents = project_dir.join(session_id).join("subagents");
    std::fs::create_dir_all(&subagents).unwrap();
    let mut agent_file =
        std::fs::File::create(subagents.join(format!("{}.jsonl", agent_id))).unwrap();
    let prompt = serde_json::json!({
        "type": "user",
        "message": {"content": "Research how the scheduler handles preemption"},
        "timestamp": "2026-01-01T10:00:01Z"
    });
    let reply = serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": result}]},
        "timestamp": "2026-01-01T10:04:00Z"
    });
    writeln!(agent_file, "{}", prompt).unwrap();
    writeln!(agent_file, "{}", reply).unwrap();
    writeln!(agent_file, "{}", serde_json::json!({"type": "result"})).unwrap();
}

fn explore_result() -> String {
    "## Overview\nThe scheduler preempts long-running tasks when a deadline slips past its budget window.\n\n## Policy\nPreemption picks the lowest priority band first and re-queues the task at the tail with its remaining quantum intact.\n".to_string()
}

#[tokio::test]
async fn test_generate_index_search_round_trip() {
    let p = pipeline().await;
    write_explore_session(&p.project_dir, "sess-1", "agent-1", &explore_result());

    let (session, agent) = p
        .sessions
        .find_subagent(&p.project_dir, "agent-1")
        .await
        .expect("explore agent discovered");
    assert_eq!(session.session_id, "sess-1");
    assert_eq!(agent.agent_type, "Explore");

    let doc = p
        .generator
        .generate(&agent, &session.session_id, "/work/repo")
        .await
        .unwrap();
    assert_eq!(doc.title, "How the scheduler handles preemption");
    assert_eq!(doc.parts.len(), 2);
    assert_eq!(doc.parts[0].title, "Overview");
    assert_eq!(doc.parts[1].title, "Policy");
    assert_eq!(doc.parts[0].part_id, format!("{}.1", doc.id));

    indexer::index_knowledge(&p.vectors, &doc).await.unwrap();
    p.vectors.rebuild_fts_index().await.unwrap();

    let hits = p
        .engine
        .search_knowledge("preemption", Some(3), None, None)
        .await
        .unwrap();
    assert!(!hits.is_empty(), "expected a hit for 'preemption'");
    let top: Vec<&str> = hits
        .iter()
        .take(3)
        .map(|h| h.part_id.as_str())
        .collect();
    assert!(
        top.iter()
            .any(|id| *id == format!("{}.1", doc.id) || *id == format!("{}.2", doc.id)),
        "expected a part of {} in the top 3, got {:?}",
        doc.id,
        top
    );
}

#[tokio::test]
async fn test_dedup_on_retry_names_existing_doc() {
    let p = pipeline().await;
    write_explore_session(&p.project_dir, "sess-1", "agent-1", &explore_result());

    let (session, agent) = p
        .sessions
        .find_subagent(&p.project_dir, "agent-1")
        .await
        .unwrap();
    let first = p
        .generator
        .generate(&agent, &session.session_id, "/work/repo")
        .await
        .unwrap();

    let err = p
        .generator
        .generate(&agent, &session.session_id, "/work/repo")
        .await
        .unwrap_err();
    match err {
        lm_assist::AssistError::Duplicate { existing_id } => {
            assert_eq!(existing_id, first.id);
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_clears_store_and_vectors() {
    let p = pipeline().await;
    write_explore_session(&p.project_dir, "sess-1", "agent-1", &explore_result());

    let (session, agent) = p
        .sessions
        .find_subagent(&p.project_dir, "agent-1")
        .await
        .unwrap();
    let doc = p
        .generator
        .generate(&agent, &session.session_id, "/work/repo")
        .await
        .unwrap();
    indexer::index_knowledge(&p.vectors, &doc).await.unwrap();
    assert!(p.vectors.has_knowledge(&doc.id).await.unwrap());

    p.store.delete(&doc.id).await.unwrap();
    p.vectors.delete_knowledge(&doc.id).await.unwrap();

    assert!(p.store.get(&doc.id, None).await.is_none());
    assert!(!p.vectors.has_knowledge(&doc.id).await.unwrap());
}

#[tokio::test]
async fn test_orphan_vectors_filtered_from_results() {
    let p = pipeline().await;
    write_explore_session(&p.project_dir, "sess-1", "agent-1", &explore_result());

    let (session, agent) = p
        .sessions
        .find_subagent(&p.project_dir, "agent-1")
        .await
        .unwrap();
    let doc = p
        .generator
        .generate(&agent, &session.session_id, "/work/repo")
        .await
        .unwrap();
    indexer::index_knowledge(&p.vectors, &doc).await.unwrap();
    p.vectors.rebuild_fts_index().await.unwrap();

    // Delete the document but leave its vectors in place.
    p.store.delete(&doc.id).await.unwrap();

    let hits = p
        .engine
        .search_knowledge("preemption", Some(5), None, None)
        .await
        .unwrap();
    assert!(
        hits.iter().all(|h| h.knowledge_id != doc.id),
        "orphan rows must be filtered at query time"
    );
}
