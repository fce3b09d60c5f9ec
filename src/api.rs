use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, StatusCode},
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    assessment::Assessment,
    error::{AppError, AppResult},
    grading::{GradeReport, Grader},
    kernel::{SessionRegistry, StartOutcome},
    metrics::MetricsRegistry,
    middleware::log_requests,
    store::{SubmissionPayload, SubmissionStore},
};

#[derive(Clone)]
pub struct AppState {
    pub assessment: Arc<Assessment>,
    pub registry: Arc<SessionRegistry>,
    pub grader: Arc<Grader>,
    pub store: SubmissionStore,
    pub metrics: Arc<MetricsRegistry>,
    pub max_code_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: String,
    pub question_id: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

pub fn routes(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/assessment", get(get_assessment))
        .route("/api/session/start", post(start_session))
        .route("/api/execute", post(execute_code))
        .route("/api/submit", post(submit_assessment))
        .layer(cors_layer(cors_origins))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let parsed: Result<Vec<HeaderValue>, _> = origins.iter().map(|o| o.parse()).collect();
    match parsed {
        Ok(origins) => CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!("invalid CORS_ORIGINS entry; falling back to permissive CORS");
            CorsLayer::permissive()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (
        StatusCode::OK,
        state.metrics.render_prometheus(state.registry.len()),
    )
}

async fn get_assessment(State(state): State<AppState>) -> Json<Assessment> {
    Json(state.assessment.as_ref().clone())
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> AppResult<Json<MessageResponse>> {
    validate_session_id(&request.session_id)?;
    let session_id = request.session_id;

    match state.registry.start(&session_id).await {
        Ok(StartOutcome::Created) => {
            state.metrics.session_started();
            Ok(MessageResponse::new(format!(
                "Session {session_id} started successfully."
            )))
        }
        Ok(StartOutcome::AlreadyExists) => Ok(MessageResponse::new(format!(
            "Session {session_id} already exists."
        ))),
        Err(err) => {
            state.metrics.session_failed();
            tracing::error!(session_id = %session_id, error = %err, "session start failed");
            Err(err)
        }
    }
}

async fn execute_code(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<GradeReport>> {
    validate_session_id(&request.session_id)?;
    if request.code.len() > state.max_code_bytes {
        return Err(AppError::InvalidRequest(format!(
            "code exceeds {} bytes",
            state.max_code_bytes
        )));
    }

    let handle = state.registry.lookup(&request.session_id)?;
    let question = state
        .assessment
        .question(&request.question_id)
        .ok_or(AppError::QuestionNotFound)?;

    let _running = handle.lock().await;
    if handle.is_closed() {
        return Err(AppError::SessionNotFound);
    }
    let report = state
        .grader
        .grade(handle.client(), question, &request.code)
        .await;
    handle.touch();

    tracing::info!(
        session_id = %handle.session_id(),
        question_id = %question.id,
        passed = report.test_results.iter().filter(|p| **p).count(),
        total = report.test_results.len(),
        "code graded"
    );
    Ok(Json(report))
}

async fn submit_assessment(
    State(state): State<AppState>,
    Json(payload): Json<SubmissionPayload>,
) -> AppResult<Json<MessageResponse>> {
    validate_session_id(&payload.session_id)?;
    let closed = state.store.finalize(&state.registry, &payload).await?;
    state.metrics.submission();
    if closed {
        state.metrics.session_closed();
    }
    Ok(MessageResponse::new("Submission received successfully!"))
}

fn validate_session_id(session_id: &str) -> AppResult<()> {
    if session_id.trim().is_empty() {
        return Err(AppError::InvalidRequest("session_id is empty".to_string()));
    }
    Ok(())
}
