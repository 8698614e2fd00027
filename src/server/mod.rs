//! HTTP surface
//!
//! Thin axum adapters over the stores, generator, retrieval engine, context
//! suggester, and sync service. Every route replies with the uniform
//! envelope `{success, data?, error?}`.

pub mod routes;

use crate::config::{AssistConfig, MachineIdentity};
use crate::error::AssistError;
use crate::knowledge::{KnowledgeGenerator, KnowledgeStore};
use crate::retrieval::context::ContextSuggester;
use crate::retrieval::RetrievalEngine;
use crate::session::SessionCache;
use crate::sync::RemoteSyncService;
use crate::vector::VectorStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ServerState {
    pub config: AssistConfig,
    pub identity: MachineIdentity,
    pub sessions: Arc<SessionCache>,
    pub knowledge: Arc<KnowledgeStore>,
    pub vectors: Arc<VectorStore>,
    pub engine: Arc<RetrievalEngine>,
    pub suggester: Arc<ContextSuggester>,
    pub generator: Arc<KnowledgeGenerator>,
    /// Present only when the hub is configured.
    pub sync: Option<Arc<RemoteSyncService>>,
    pub shutdown: Arc<AtomicBool>,
}

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Error half of every handler: an `AssistError` mapped onto an HTTP status
/// plus the envelope.
pub struct ApiError(pub AssistError);

impl From<AssistError> for ApiError {
    fn from(err: AssistError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(AssistError::Other(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AssistError::InvalidRequest(_) | AssistError::Parse(_) => StatusCode::BAD_REQUEST,
            AssistError::NotFound(_) => StatusCode::NOT_FOUND,
            AssistError::Duplicate { .. } | AssistError::Conflict(_) => StatusCode::CONFLICT,
            AssistError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AssistError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AssistError::Io { .. } | AssistError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            }),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Build the full router.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/projects", get(routes::list_projects))
        .route("/knowledge", get(routes::list_knowledge))
        .route("/knowledge", post(routes::create_knowledge))
        .route("/knowledge/search", get(routes::search_knowledge))
        .route("/knowledge/generate", post(routes::generate_one))
        .route("/knowledge/generate/all", post(routes::generate_all))
        .route("/knowledge/generate/stop", post(routes::generate_stop))
        .route("/knowledge/generate/status", get(routes::generate_status))
        .route("/knowledge/remote-sync", post(routes::remote_sync_start))
        .route(
            "/knowledge/remote-sync/status",
            get(routes::remote_sync_status),
        )
        .route("/knowledge/:id", get(routes::get_knowledge))
        .route("/knowledge/:id", put(routes::update_knowledge))
        .route("/knowledge/:id", delete(routes::delete_knowledge))
        .route("/knowledge/:id/parts/:part_id", get(routes::get_part))
        .route("/knowledge/:id/comments", get(routes::list_comments))
        .route("/knowledge/:id/comments", post(routes::add_comment))
        .route(
            "/knowledge/:id/comments/:comment_id/address",
            post(routes::address_comment),
        )
        .route("/context/suggest", post(routes::suggest_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(state: ServerState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.port));
    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP surface listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
