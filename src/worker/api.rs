//! Worker HTTP API: task intake, task listing, stop intents, and host
//! stats.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stats::Stats;
use crate::task::{State as TaskState, Task, TaskEvent};
use crate::worker::Worker;

/// JSON error body returned on non-2xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrResponse {
    pub status_code: u16,
    pub message: String,
}

pub fn router(worker: Arc<Worker>) -> Router {
    Router::new()
        .route("/tasks", get(get_tasks_handler).post(start_task_handler))
        .route("/tasks/{task_id}", axum::routing::delete(stop_task_handler))
        .route("/stats", get(get_stats_handler))
        .with_state(worker)
}

/// Serve the API until the shutdown token fires. `addr` is `host:port`;
/// hostnames are resolved at bind time.
pub async fn serve(
    worker: Arc<Worker>,
    addr: String,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %addr, "starting worker API");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(worker))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrResponse {
            status_code: status.as_u16(),
            message,
        }),
    )
        .into_response()
}

async fn start_task_handler(
    State(worker): State<Arc<Worker>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    let Json(event) = match payload {
        Ok(event) => event,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    tracing::info!(task_id = %event.task.id, event_id = %event.id, "queueing task");
    let task = event.task.clone();
    worker.add_task(event.task).await;

    (StatusCode::CREATED, Json(task)).into_response()
}

async fn get_tasks_handler(State(worker): State<Arc<Worker>>) -> Json<Vec<Task>> {
    Json(worker.get_tasks().await)
}

async fn stop_task_handler(
    State(worker): State<Arc<Worker>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    match worker.get_task(task_id).await {
        Some(mut task) => {
            // A stop intent: the execution loop performs the actual stop.
            task.state = TaskState::Completed;
            tracing::info!(task_id = %task_id, "queueing stop for task");
            worker.add_task(task).await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no task with id {task_id} found"),
        ),
    }
}

async fn get_stats_handler(State(worker): State<Arc<Worker>>) -> Json<Stats> {
    Json(worker.stats_snapshot().await)
}
