//! Manager HTTP API: task submission, listing, and stop requests.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::manager::Manager;
use crate::task::{State as TaskState, Task, TaskEvent};
use crate::worker::api::ErrResponse;

pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/tasks", get(get_tasks_handler).post(start_task_handler))
        .route("/tasks/{task_id}", axum::routing::delete(stop_task_handler))
        .with_state(manager)
}

/// Serve the API until the shutdown token fires. `addr` is `host:port`;
/// hostnames are resolved at bind time.
pub async fn serve(
    manager: Arc<Manager>,
    addr: String,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = %addr, "starting manager API");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(manager))
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
    State(manager): State<Arc<Manager>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    let Json(event) = match payload {
        Ok(event) => event,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    tracing::info!(task_id = %event.task.id, event_id = %event.id, "received task submission");
    let task = event.task.clone();
    manager.add_task(event).await;

    (StatusCode::CREATED, Json(task)).into_response()
}

async fn get_tasks_handler(State(manager): State<Arc<Manager>>) -> Json<Vec<Task>> {
    Json(manager.get_tasks().await)
}

async fn stop_task_handler(
    State(manager): State<Arc<Manager>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    match manager.get_task(task_id).await {
        Some(task) => {
            // The completion intent travels the same path as a submission.
            let event = TaskEvent::new(TaskState::Completed, task);
            tracing::info!(task_id = %task_id, event_id = %event.id, "received stop request");
            manager.add_task(event).await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no task with id {task_id} found"),
        ),
    }
}
