//! HTTP API server.
//!
//! Exposes the ingestion trigger and question-answering functionality as a
//! JSON HTTP API for the dashboard and external schedulers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sync` | Sync all configured repositories |
//! | `POST` | `/sync/{owner}/{name}` | Sync one repository |
//! | `POST` | `/users/{user}/weeks/{week}/questions` | Ask a question about a week |
//! | `GET`  | `/users/{user}/weeks/{week}/conversations/history` | Conversation history |
//! | `DELETE` | `/users/{user}/weeks/{week}/conversations` | Reset the conversation |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Error responses use the envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conversation_mismatch`
//! (400), `internal` (500). Sync failures and answer-generation failures are
//! reported inside well-formed 200 responses, not as 5xx.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! dashboard clients.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{self, AnswerProvider, QuestionResponse};
use crate::config::Config;
use crate::conversation::{
    ConversationError, ConversationStore, ConversationThread, MemoryConversationStore,
};
use crate::db;
use crate::ingest;
use crate::models::{is_week_label, SyncReport};
use crate::source::{GithubClient, SourceApi};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    conversations: Arc<dyn ConversationStore>,
    answerer: Arc<dyn AnswerProvider>,
    source: Arc<dyn SourceApi>,
}

/// Start the HTTP API server on the configured bind address.
///
/// The conversation store is constructed here; swapping the in-memory store
/// for a shared backend only touches this function.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    let source = GithubClient::new(&config.github, &config.sync)?;
    let answerer = answer::create_provider(&config.answer)?;

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        conversations: Arc::new(MemoryConversationStore::new()),
        answerer: Arc::from(answerer),
        source: Arc::new(source),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/sync", post(handle_sync_all))
        .route("/sync/{owner}/{name}", post(handle_sync_repo))
        .route("/users/{user}/weeks/{week}/questions", post(handle_question))
        .route(
            "/users/{user}/weeks/{week}/conversations/history",
            get(handle_history),
        )
        .route(
            "/users/{user}/weeks/{week}/conversations",
            delete(handle_clear_conversation),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

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

fn bad_request(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: code.to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map orchestration errors onto the error contract: conversation validation
/// problems are client errors, everything else is internal.
fn classify_answer_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<ConversationError>() {
        Some(ConversationError::Mismatch { .. }) => {
            bad_request("conversation_mismatch", err.to_string())
        }
        Some(ConversationError::Unknown(_)) => not_found(err.to_string()),
        None => internal(err.to_string()),
    }
}

fn validate_week(week: &str) -> Result<(), AppError> {
    if is_week_label(week) {
        Ok(())
    } else {
        Err(bad_request(
            "bad_request",
            format!("'{}' is not an ISO week label (expected YYYY-Www)", week),
        ))
    }
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

// ============ POST /sync ============

async fn handle_sync_all(State(state): State<AppState>) -> Json<SyncReport> {
    let report = ingest::sync_all(
        &state.pool,
        &state.config,
        state.source.clone(),
        false,
    )
    .await;
    Json(report)
}

// ============ POST /sync/{owner}/{name} ============

async fn handle_sync_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<SyncReport>, AppError> {
    let full_name = format!("{}/{}", owner, name);
    let repo = state
        .config
        .github
        .repositories
        .iter()
        .find(|r| r.full_name() == full_name)
        .cloned()
        .ok_or_else(|| not_found(format!("repository not configured: {}", full_name)))?;

    let started = std::time::Instant::now();
    let repo_report = ingest::sync_repository(
        &state.pool,
        &state.config,
        state.source.as_ref(),
        &repo,
        false,
    )
    .await;
    let report = SyncReport::from_repo_reports(
        std::slice::from_ref(&repo_report),
        started.elapsed().as_millis() as u64,
    );
    Ok(Json(report))
}

// ============ POST /users/{user}/weeks/{week}/questions ============

#[derive(Deserialize)]
struct QuestionRequest {
    question: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

async fn handle_question(
    State(state): State<AppState>,
    Path((user, week)): Path<(String, String)>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<QuestionResponse>, AppError> {
    validate_week(&week)?;
    if request.question.trim().is_empty() {
        return Err(bad_request("bad_request", "question must not be empty"));
    }

    let response = answer::answer_question(
        &state.pool,
        &state.config,
        state.conversations.as_ref(),
        state.answerer.as_ref(),
        &user,
        &week,
        &request.question,
        request.conversation_id.as_deref(),
    )
    .await
    .map_err(classify_answer_error)?;

    Ok(Json(response))
}

// ============ GET /users/{user}/weeks/{week}/conversations/history ============

#[derive(Serialize)]
struct HistoryResponse {
    subject: String,
    week: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation: Option<ConversationThread>,
}

async fn handle_history(
    State(state): State<AppState>,
    Path((user, week)): Path<(String, String)>,
) -> Result<Json<HistoryResponse>, AppError> {
    validate_week(&week)?;

    let conversation = state
        .conversations
        .history(&user, &week)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(HistoryResponse {
        subject: user,
        week,
        conversation,
    }))
}

// ============ DELETE /users/{user}/weeks/{week}/conversations ============

#[derive(Serialize)]
struct ClearResponse {
    status: String,
}

async fn handle_clear_conversation(
    State(state): State<AppState>,
    Path((user, week)): Path<(String, String)>,
) -> Result<Json<ClearResponse>, AppError> {
    validate_week(&week)?;

    state
        .conversations
        .clear(&user, &week)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(ClearResponse {
        status: "cleared".to_string(),
    }))
}
