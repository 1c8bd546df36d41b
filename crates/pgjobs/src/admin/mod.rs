//! Read-only admin API: health, queue stats and job lookup.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::error::QueueError;
use crate::jobs::{Job, Queue, QueueStats};

#[derive(Clone)]
pub struct AdminState {
    pub queue: Queue,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/jobs/:id", get(get_job))
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn stats(
    State(st): State<AdminState>,
) -> Result<Json<QueueStats>, (StatusCode, String)> {
    let stats = st.queue.get_queue_stats().await.map_err(queue_err)?;
    Ok(Json(stats))
}

pub async fn get_job(
    State(st): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, String)> {
    match st.queue.get_job_status(id).await.map_err(queue_err)? {
        Some(job) => Ok(Json(job)),
        None => Err((StatusCode::NOT_FOUND, format!("job {id} not found"))),
    }
}

fn queue_err(e: QueueError) -> (StatusCode, String) {
    match e {
        QueueError::JobNotFound(id) => (StatusCode::NOT_FOUND, format!("job {id} not found")),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal error: {other}"),
        ),
    }
}
