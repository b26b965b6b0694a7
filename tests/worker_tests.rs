use std::sync::Arc;

use cube::config::WorkerConfig;
use cube::stats::Stats;
use cube::task::{State, Task, TaskEvent};
use cube::worker::api::{router, ErrResponse};
use cube::worker::Worker;

fn test_worker() -> Arc<Worker> {
    let config = WorkerConfig {
        name: "worker-test".to_string(),
        ..Default::default()
    };
    Arc::new(Worker::new(&config).unwrap())
}

/// Bind the worker API on an ephemeral port and return its base URL.
async fn spawn_api(worker: Arc<Worker>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(worker)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_add_task_enqueues() {
    let worker = test_worker();
    assert_eq!(worker.queue_len().await, 0);

    worker.add_task(Task::new("t1", "nginx")).await;
    worker.add_task(Task::new("t2", "nginx")).await;
    assert_eq!(worker.queue_len().await, 2);

    // Nothing is persisted until the execution loop runs.
    assert!(worker.get_tasks().await.is_empty());
}

#[tokio::test]
async fn test_post_task_returns_created_and_enqueues() {
    let worker = test_worker();
    let base = spawn_api(worker.clone()).await;
    let client = reqwest::Client::new();

    let mut task = Task::new("web", "nginx:latest");
    task.state = State::Scheduled;
    let event = TaskEvent::new(State::Running, task.clone());

    let resp = client
        .post(format!("{base}/tasks"))
        .json(&event)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    let returned: Task = resp.json().await.unwrap();
    assert_eq!(returned.id, task.id);
    assert_eq!(worker.queue_len().await, 1);
}

#[tokio::test]
async fn test_post_malformed_body_is_rejected() {
    let worker = test_worker();
    let base = spawn_api(worker.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/tasks"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let err: ErrResponse = resp.json().await.unwrap();
    assert_eq!(err.status_code, 400);
    assert_eq!(worker.queue_len().await, 0);
}

#[tokio::test]
async fn test_get_tasks_lists_store_contents() {
    let worker = test_worker();
    let base = spawn_api(worker.clone()).await;

    let tasks: Vec<Task> = reqwest::get(format!("{base}/tasks"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_task_is_not_found() {
    let worker = test_worker();
    let base = spawn_api(worker.clone()).await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("{base}/tasks/{}", uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let err: ErrResponse = resp.json().await.unwrap();
    assert_eq!(err.status_code, 404);
}

#[tokio::test]
async fn test_stats_endpoint_serves_snapshot() {
    let worker = test_worker();
    let base = spawn_api(worker.clone()).await;

    let resp = reqwest::get(format!("{base}/stats")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // The collection loop has not run, so this is the zeroed snapshot.
    let stats: Stats = resp.json().await.unwrap();
    assert_eq!(stats.task_count, 0);
}
