//! HTTP API for the chat service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Run a chat turn, streamed as server-sent events |
//! | `POST` | `/documents` | Upload a document into a conversation (multipart) |
//! | `POST` | `/search` | Search one conversation's uploaded documents |
//! | `GET`  | `/conversations` | List the caller's conversations |
//! | `GET`  | `/conversations/{id}/messages` | Messages of an owned conversation |
//! | `DELETE` | `/conversations/{id}` | Delete a conversation and its vectors |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The caller's identity arrives in the `x-user-id` header; every request
//! except `/health` requires it. Document uploads name their conversation
//! in `x-conversation-id`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `upstream_error`
//! (502), `internal` (500). Once a chat stream has started, failures are
//! delivered as a terminal in-band `error` event instead of a status code.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chat::{self, ChatTurnDeps};
use crate::completion::{CompletionClient, OpenAICompletionClient};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::ChatError;
use crate::ingest::{self, IngestReport};
use crate::models::{Conversation, Message, VectorMatch};
use crate::retrieval::RetrievalEngine;
use crate::store::ConversationStore;
use crate::vector::{SqliteVectorIndex, VectorIndex};
use crate::{db, migrate};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: ConversationStore,
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    retrieval: Arc<RetrievalEngine>,
    completion_client: Arc<dyn CompletionClient>,
}

/// Starts the HTTP server: connects the database, runs migrations, builds
/// the embedding provider and vector index, and serves until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;

    let provider: Arc<dyn EmbeddingProvider> =
        embedding::create_provider(&config.embedding)?.into();
    let index: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(pool.clone()));
    let retrieval = Arc::new(RetrievalEngine::new(
        index.clone(),
        provider.clone(),
        config.embedding.clone(),
        config.retrieval.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        store: ConversationStore::new(pool),
        index,
        provider,
        retrieval,
        completion_client: Arc::new(OpenAICompletionClient),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/documents", post(handle_upload))
        .route("/search", post(handle_search))
        .route("/conversations", get(handle_list_conversations))
        .route("/conversations/{id}/messages", get(handle_get_messages))
        .route("/conversations/{id}", delete(handle_delete_conversation))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(config.upload.max_bytes))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "chat server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Map a pipeline error onto the HTTP contract, gating detail on the
/// verbose-errors setting.
fn app_error(err: ChatError, verbose: bool) -> AppError {
    let message = err.client_message(verbose);
    let (status, code) = match err {
        ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        ChatError::Authorization => (StatusCode::FORBIDDEN, "forbidden"),
        ChatError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        ChatError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    AppError {
        status,
        code: code.to_string(),
        message,
    }
}

/// Extract the caller's identity from `x-user-id`.
fn require_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request("x-user-id header is required"))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

/// Handler for `POST /chat`.
///
/// Validation and ownership are checked before the stream is committed,
/// so they still produce status codes. Everything after that arrives as
/// SSE events: `conversation` (once, if newly created), `content` per
/// fragment, then a terminal `done` or `error`.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    let ctx = chat::prepare_turn(
        &state.store,
        &user_id,
        &req.message,
        req.conversation_id.as_deref(),
    )
    .await
    .map_err(|e| app_error(e, verbose))?;

    let deps = ChatTurnDeps {
        store: state.store.clone(),
        retrieval: state.retrieval.clone(),
        client: state.completion_client.clone(),
        completion: state.config.completion.clone(),
        server: state.config.server.clone(),
    };

    let events = chat::stream_turn(deps, ctx, req.message)
        .map(|e| Ok(Event::default().event(e.name()).data(e.payload())));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ POST /documents ============

/// Handler for `POST /documents`.
///
/// Multipart upload of a single file into the conversation named by the
/// `x-conversation-id` header. The caller must own that conversation.
async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    let conversation_id = headers
        .get("x-conversation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request("x-conversation-id header is required"))?;

    state
        .store
        .get_owned(&conversation_id, &user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file part must carry a filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {e}")))?;
        file = Some((name, bytes.to_vec()));
        break;
    }
    let (name, bytes) =
        file.ok_or_else(|| bad_request("multipart body must contain a 'file' part"))?;

    let report = ingest::ingest_upload(
        &state.config,
        state.index.as_ref(),
        state.provider.as_ref(),
        &bytes,
        &name,
        &conversation_id,
    )
    .await
    .map_err(|e| app_error(e, verbose))?;

    Ok(Json(report))
}

// ============ POST /search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    conversation_id: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<VectorMatch>,
}

/// Handler for `POST /search`: semantic search over the documents
/// uploaded into one owned conversation.
async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    state
        .store
        .get_owned(&req.conversation_id, &user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    let results = state
        .retrieval
        .search_documents(&req.query, &req.conversation_id, req.top_k)
        .await
        .map_err(|e| app_error(e, verbose))?;

    Ok(Json(SearchResponse { results }))
}

// ============ Conversation routes ============

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<Conversation>,
}

async fn handle_list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConversationListResponse>, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    let conversations = state
        .store
        .get_conversations(&user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    Ok(Json(ConversationListResponse { conversations }))
}

#[derive(Serialize)]
struct MessageListResponse {
    messages: Vec<Message>,
}

async fn handle_get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<MessageListResponse>, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    let messages = state
        .store
        .get_conversation_messages(&id, &user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    Ok(Json(MessageListResponse { messages }))
}

/// Handler for `DELETE /conversations/{id}`.
///
/// Vector records are deleted before the conversation row; if vector
/// cleanup fails the conversation survives, so orphaned tagged vectors
/// cannot outlive their isolation boundary.
async fn handle_delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let user_id = require_user(&headers)?;
    let verbose = state.config.server.verbose_errors;

    state
        .store
        .get_owned(&id, &user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    state
        .index
        .delete_conversation(&id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    state
        .store
        .delete_conversation(&id, &user_id)
        .await
        .map_err(|e| app_error(e, verbose))?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_matches_contract() {
        let e = app_error(ChatError::validation("bad input"), false);
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "bad_request");
        assert_eq!(e.message, "bad input");

        let e = app_error(ChatError::Authorization, true);
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.message, "not authorized");

        let e = app_error(ChatError::upstream(anyhow::anyhow!("boom")), false);
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);
        assert_eq!(e.message, "upstream provider error");
    }

    #[test]
    fn user_header_required_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert!(require_user(&headers).is_err());

        headers.insert("x-user-id", "  alice  ".parse().unwrap());
        assert_eq!(require_user(&headers).unwrap(), "alice");

        headers.insert("x-user-id", "   ".parse().unwrap());
        assert!(require_user(&headers).is_err());
    }
}
