//! Route handlers for the HTTP surface.

use crate::error::AssistError;
use crate::knowledge::models::IndexEntry;
use crate::knowledge::{
    Comment, CommentSource, CommentType, Knowledge, KnowledgePart, KnowledgePatch, KnowledgeType,
    ListFilter, NewKnowledge,
};
use crate::paths::decode_project_dir;
use crate::retrieval::context::ContextSuggestion;
use crate::retrieval::KnowledgeSearchResult;
use crate::server::{ApiError, ApiResponse, ApiResult, ServerState};
use crate::sync::git::normalized_fetch_remotes;
use crate::sync::{PeerProject, SyncStatus};
use crate::vector::indexer;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBody {
    pub status: &'static str,
    pub machine_id: String,
    pub knowledge_count: usize,
    pub vector_rows: usize,
}

pub async fn health(State(state): State<ServerState>) -> ApiResult<HealthBody> {
    let vector_rows = state.vectors.content_row_count().await.unwrap_or(0);
    Ok(ApiResponse::ok(HealthBody {
        status: "ok",
        machine_id: state.identity.machine_id.clone(),
        knowledge_count: state.knowledge.count().await,
        vector_rows,
    }))
}

/// Projects known to this workstation: every decodable directory under the
/// transcript root, with its normalized fetch remotes. Peers call this
/// through the relay during sync.
pub async fn list_projects(State(state): State<ServerState>) -> ApiResult<Vec<PeerProject>> {
    let mut projects = Vec::new();
    let projects_dir = state.config.projects_dir();
    let Ok(mut dir) = tokio::fs::read_dir(&projects_dir).await else {
        return Ok(ApiResponse::ok(projects));
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(project) = decode_project_dir(&name) else {
            continue;
        };
        let remotes = normalized_fetch_remotes(PathBuf::from(&project).as_path())
            .await
            .unwrap_or_default();
        projects.push(PeerProject { project, remotes });
    }
    Ok(ApiResponse::ok(projects))
}

pub async fn list_knowledge(
    State(state): State<ServerState>,
    Query(filter): Query<ListFilter>,
) -> ApiResult<Vec<IndexEntry>> {
    Ok(ApiResponse::ok(state.knowledge.list(&filter).await))
}

#[derive(Deserialize)]
pub struct GetKnowledgeQuery {
    #[serde(default)]
    pub machine_id: Option<String>,
}

pub async fn get_knowledge(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<GetKnowledgeQuery>,
) -> ApiResult<Knowledge> {
    let doc = state
        .knowledge
        .get(&id, query.machine_id.as_deref())
        .await
        .ok_or_else(|| AssistError::NotFound(format!("knowledge {}", id)))?;
    Ok(ApiResponse::ok((*doc).clone()))
}

pub async fn get_part(
    State(state): State<ServerState>,
    Path((id, part_id)): Path<(String, String)>,
) -> ApiResult<KnowledgePart> {
    let doc = state
        .knowledge
        .resolve(&id)
        .await
        .ok_or_else(|| AssistError::NotFound(format!("knowledge {}", id)))?;
    let part = doc
        .part(&part_id)
        .ok_or_else(|| AssistError::NotFound(format!("part {}", part_id)))?;
    Ok(ApiResponse::ok(part.clone()))
}

/// Create body: either a structured document or `{"markdown": "..."}`.
pub async fn create_knowledge(
    State(state): State<ServerState>,
    Json(body): Json<Value>,
) -> ApiResult<Knowledge> {
    let doc = if let Some(markdown) = body.get("markdown").and_then(Value::as_str) {
        state.knowledge.create_from_markdown(markdown).await?
    } else {
        let data: NewKnowledge = serde_json::from_value(body)
            .map_err(|e| AssistError::InvalidRequest(format!("bad create body: {}", e)))?;
        state.knowledge.create(data).await?
    };

    index_best_effort(&state, &doc).await;
    Ok(ApiResponse::ok((*doc).clone()))
}

pub async fn update_knowledge(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(patch): Json<KnowledgePatch>,
) -> ApiResult<Knowledge> {
    let doc = state.knowledge.update(&id, None, patch).await?;
    if let Err(e) = indexer::reindex_knowledge(&state.vectors, &doc).await {
        debug!("Reindex of {} failed (ignored): {}", doc.id, e);
    }
    rebuild_fts_best_effort(&state).await;
    Ok(ApiResponse::ok((*doc).clone()))
}

#[derive(Serialize)]
pub struct DeletedBody {
    pub deleted: String,
}

pub async fn delete_knowledge(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<DeletedBody> {
    state.knowledge.delete(&id).await?;
    if let Err(e) = state.vectors.delete_knowledge(&id).await {
        debug!("Vector delete for {} failed (ignored): {}", id, e);
    }
    Ok(ApiResponse::ok(DeletedBody { deleted: id }))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, rename = "type")]
    pub knowledge_type: Option<KnowledgeType>,
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn search_knowledge(
    State(state): State<ServerState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<KnowledgeSearchResult>> {
    if query.query.trim().is_empty() {
        return Err(ApiError(AssistError::InvalidRequest(
            "query must not be empty".into(),
        )));
    }
    let results = state
        .engine
        .search_knowledge(
            &query.query,
            query.limit,
            query.knowledge_type,
            query.project.as_deref(),
        )
        .await?;
    Ok(ApiResponse::ok(results))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub project: String,
    pub agent_id: String,
}

pub async fn generate_one(
    State(state): State<ServerState>,
    Json(body): Json<GenerateBody>,
) -> ApiResult<Knowledge> {
    let project_dir = state
        .config
        .projects_dir()
        .join(crate::paths::encode_project_path(&body.project));
    let (session, agent) = state
        .sessions
        .find_subagent(&project_dir, &body.agent_id)
        .await
        .ok_or_else(|| AssistError::NotFound(format!("sub-agent {}", body.agent_id)))?;

    let doc = state
        .generator
        .generate(&agent, &session.session_id, &body.project)
        .await?;
    index_best_effort(&state, &doc).await;
    Ok(ApiResponse::ok((*doc).clone()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAllBody {
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn generate_all(
    State(state): State<ServerState>,
    Json(body): Json<GenerateAllBody>,
) -> ApiResult<crate::knowledge::GenerateAllResult> {
    let projects: Vec<String> = match body.project {
        Some(project) => vec![project],
        None => {
            // All projects with transcripts.
            let mut all = Vec::new();
            if let Ok(mut dir) = tokio::fs::read_dir(state.config.projects_dir()).await {
                while let Ok(Some(entry)) = dir.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(project) = decode_project_dir(&name) {
                        all.push(project);
                    }
                }
            }
            all
        }
    };

    let mut merged = crate::knowledge::GenerateAllResult {
        generated: 0,
        errors: Vec::new(),
        stopped: false,
    };
    for project in projects {
        let project_dir = state
            .config
            .projects_dir()
            .join(crate::paths::encode_project_path(&project));
        let result = state.generator.generate_all(&project_dir, &project).await;
        merged.generated += result.generated;
        merged.errors.extend(result.errors);
        if result.stopped {
            merged.stopped = true;
            break;
        }
    }

    // Newly generated documents need vectors; index whatever the batch
    // produced, then refresh FTS once.
    if merged.generated > 0 {
        reindex_missing(&state).await;
        rebuild_fts_best_effort(&state).await;
    }
    Ok(ApiResponse::ok(merged))
}

pub async fn generate_stop(State(state): State<ServerState>) -> ApiResult<&'static str> {
    state.generator.request_stop();
    Ok(ApiResponse::ok("stopping"))
}

pub async fn generate_status(
    State(state): State<ServerState>,
) -> ApiResult<crate::knowledge::GeneratorStatus> {
    Ok(ApiResponse::ok(state.generator.status()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncBody {
    pub project: String,
}

pub async fn remote_sync_start(
    State(state): State<ServerState>,
    Json(body): Json<RemoteSyncBody>,
) -> ApiResult<&'static str> {
    let sync = state
        .sync
        .as_ref()
        .ok_or_else(|| AssistError::InvalidRequest("hub is not configured".into()))?;
    sync.start(PathBuf::from(body.project))
        .map_err(|e| AssistError::Conflict(e.to_string()))?;
    Ok(ApiResponse::ok("started"))
}

pub async fn remote_sync_status(State(state): State<ServerState>) -> ApiResult<SyncStatus> {
    let sync = state
        .sync
        .as_ref()
        .ok_or_else(|| AssistError::InvalidRequest("hub is not configured".into()))?;
    Ok(ApiResponse::ok(sync.status()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentBody {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(rename = "type")]
    pub comment_type: CommentType,
    pub content: String,
    pub source: CommentSource,
}

pub async fn list_comments(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Comment>> {
    Ok(ApiResponse::ok(state.knowledge.list_comments(&id).await))
}

pub async fn add_comment(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<CommentBody>,
) -> ApiResult<Comment> {
    let comment = state
        .knowledge
        .add_comment(&id, body.part_id, body.comment_type, body.content, body.source)
        .await?;
    Ok(ApiResponse::ok(comment))
}

pub async fn address_comment(
    State(state): State<ServerState>,
    Path((id, comment_id)): Path<(String, u64)>,
) -> ApiResult<Comment> {
    let comment = state.knowledge.mark_comment_addressed(&id, comment_id).await?;
    Ok(ApiResponse::ok(comment))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestBody {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn suggest_context(
    State(state): State<ServerState>,
    Json(body): Json<SuggestBody>,
) -> ApiResult<ContextSuggestion> {
    let suggestion = state
        .suggester
        .suggest(
            &body.prompt,
            body.session_id.as_deref(),
            body.project.as_deref(),
        )
        .await;
    Ok(ApiResponse::ok(suggestion))
}

async fn index_best_effort(state: &ServerState, doc: &Knowledge) {
    indexer::index_knowledge_best_effort(&state.vectors, doc).await;
    rebuild_fts_best_effort(state).await;
}

async fn rebuild_fts_best_effort(state: &ServerState) {
    if let Err(e) = state.vectors.rebuild_fts_index().await {
        debug!("FTS rebuild failed (ignored): {}", e);
    }
}

/// Index documents that have no vector rows yet (post-batch catch-up).
async fn reindex_missing(state: &ServerState) {
    let entries = state.knowledge.list(&ListFilter::default()).await;
    for entry in entries {
        let key = crate::knowledge::models::index_key(&entry.id, entry.machine_id.as_deref());
        match state.vectors.has_knowledge(&key).await {
            Ok(true) => continue,
            Ok(false) => {
                if let Some(doc) = state
                    .knowledge
                    .get(&entry.id, entry.machine_id.as_deref())
                    .await
                {
                    indexer::index_knowledge_best_effort(&state.vectors, &doc).await;
                }
            }
            Err(e) => {
                warn!("Vector lookup for {} failed: {}", key, e);
                break;
            }
        }
    }
}
