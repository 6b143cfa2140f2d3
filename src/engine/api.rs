use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use uuid::Uuid;

use crate::engine::{
    error::EngineError,
    models::{EvaluationSummary, Submission, SubmissionRequest},
    service::SubmissionEngine,
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<SubmissionEngine>,
}

pub fn routes(engine: Arc<SubmissionEngine>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/submissions", post(submit))
        .route("/v1/submissions/{id}", get(get_submission))
        .route("/v1/submissions/{id}/invalidate", post(invalidate))
        .route("/v1/evaluations/{task_id}/{user_id}", get(get_evaluation))
        .with_state(AppState { engine })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.engine.metrics().render_prometheus())
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmissionRequest>,
) -> Result<(StatusCode, Json<Submission>), EngineError> {
    let submission = state.engine.submit(request).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Submission>, EngineError> {
    let submission = state.engine.store().get(&id).ok_or(EngineError::NotFound)?;
    Ok(Json(submission))
}

async fn invalidate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Submission>, EngineError> {
    Ok(Json(state.engine.invalidate(id).await?))
}

async fn get_evaluation(
    State(state): State<AppState>,
    Path((task_id, user_id)): Path<(String, String)>,
) -> Result<Json<EvaluationSummary>, EngineError> {
    let summary = state
        .engine
        .store()
        .summary(&task_id, &user_id, Utc::now())
        .ok_or(EngineError::NotFound)?;
    Ok(Json(summary))
}
