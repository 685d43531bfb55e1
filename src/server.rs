//! HTTP surface over the task queue.
//!
//! - `POST /process-pdf[?filename=...]` – raw PDF bytes in the body. Returns
//!   `202 Accepted` with `{ "task_id": "..." }` as soon as the task is
//!   recorded; validation of the bytes happens in the worker, so an empty
//!   or non-PDF upload ends as a `FAILURE` task with class `invalid_input`.
//! - `GET /tasks/{task_id}` – `{ task_id, status, retry_count, result | error, ... }`,
//!   or `404` for an unknown id.
//! - `GET /health` – `{ "status": "ok" }`.

use crate::model::SourceDocument;
use crate::queue::TaskQueue;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Build the HTTP router for `queue`.
pub fn create_router(queue: Arc<TaskQueue>) -> Router {
    Router::new()
        .route("/process-pdf", post(process_pdf))
        .route("/tasks/:task_id", get(task_status))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(queue)
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    task_id: String,
}

async fn process_pdf(
    State(queue): State<Arc<TaskQueue>>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> (StatusCode, Json<Accepted>) {
    let document = SourceDocument::new(body.to_vec(), params.filename);
    let task_id = queue.enqueue(document).await;
    (StatusCode::ACCEPTED, Json(Accepted { task_id }))
}

async fn task_status(State(queue): State<Arc<TaskQueue>>, Path(task_id): Path<String>) -> Response {
    match queue.status(&task_id) {
        Some(task) => Json(task).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown task '{}'", task_id) })),
        )
            .into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
