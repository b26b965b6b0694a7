//! Manager integration tests against a stub worker API.
//!
//! The stub speaks just enough of the worker surface for dispatch,
//! reconciliation and health-check flows: POST /tasks echoes 201, GET
//! /tasks serves a canned task list, DELETE records stop requests, and
//! /health answers with a configurable status.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use bollard::models::{PortBinding, PortMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use cube::config::{DbKind, ManagerConfig, SchedulerKind};
use cube::error::CubeError;
use cube::manager::{first_host_port, Manager};
use cube::task::{State as TaskState, Task, TaskEvent};

#[derive(Clone, Default)]
struct StubWorker {
    tasks: Arc<Mutex<Vec<Task>>>,
    posts: Arc<Mutex<Vec<TaskEvent>>>,
    deletes: Arc<Mutex<Vec<Uuid>>>,
    health_status: Arc<AtomicU16>,
}

impl StubWorker {
    fn new(health_status: u16) -> Self {
        Self {
            health_status: Arc::new(AtomicU16::new(health_status)),
            ..Default::default()
        }
    }

    async fn set_tasks(&self, tasks: Vec<Task>) {
        *self.tasks.lock().await = tasks;
    }
}

fn stub_router(stub: StubWorker) -> Router {
    Router::new()
        .route("/tasks", get(stub_list).post(stub_post))
        .route("/tasks/{task_id}", delete(stub_delete))
        .route("/health", get(stub_health))
        .with_state(stub)
}

async fn stub_list(State(stub): State<StubWorker>) -> Json<Vec<Task>> {
    Json(stub.tasks.lock().await.clone())
}

async fn stub_post(
    State(stub): State<StubWorker>,
    Json(event): Json<TaskEvent>,
) -> (StatusCode, Json<Task>) {
    let task = event.task.clone();
    stub.posts.lock().await.push(event);
    (StatusCode::CREATED, Json(task))
}

async fn stub_delete(State(stub): State<StubWorker>, Path(task_id): Path<Uuid>) -> StatusCode {
    stub.deletes.lock().await.push(task_id);
    StatusCode::NO_CONTENT
}

async fn stub_health(State(stub): State<StubWorker>) -> StatusCode {
    StatusCode::from_u16(stub.health_status.load(Ordering::Relaxed)).unwrap()
}

/// Bind the stub on an ephemeral port and return its `host:port` address.
async fn spawn_stub(stub: StubWorker) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, stub_router(stub)).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn manager_for(workers: Vec<String>, scheduler: SchedulerKind) -> Arc<Manager> {
    Arc::new(
        Manager::new(&ManagerConfig {
            workers,
            scheduler,
            db_type: DbKind::Memory,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn submission(task: Task) -> TaskEvent {
    TaskEvent::new(TaskState::Running, task)
}

#[tokio::test]
async fn test_dispatch_places_task_on_worker() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr.clone()], SchedulerKind::RoundRobin);

    let mut task = Task::new("web", "nginx:latest");
    task.memory = 64_000_000;
    let task_id = task.id;

    manager.add_task(submission(task)).await;
    manager.send_work().await;

    assert_eq!(manager.worker_for_task(task_id).await, Some(addr.clone()));
    assert_eq!(manager.tasks_for_worker(&addr).await, vec![task_id]);

    let persisted = manager.get_task(task_id).await.unwrap();
    assert_eq!(persisted.state, TaskState::Scheduled);

    // The worker received the original submission event.
    let posts = stub.posts.lock().await;
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].task.id, task_id);

    let node = manager.worker_nodes.first().unwrap().snapshot().await;
    assert_eq!(node.task_count, 1);
    assert_eq!(node.memory_allocated, 64_000_000 / 1000);
}

#[tokio::test]
async fn test_round_robin_distributes_across_workers() {
    let mut addrs = Vec::new();
    for _ in 0..3 {
        addrs.push(spawn_stub(StubWorker::new(200)).await);
    }
    let manager = manager_for(addrs.clone(), SchedulerKind::RoundRobin);

    for i in 0..6 {
        manager
            .add_task(submission(Task::new(format!("t{i}"), "nginx")))
            .await;
    }
    for _ in 0..6 {
        manager.send_work().await;
    }

    for addr in &addrs {
        assert_eq!(
            manager.tasks_for_worker(addr).await.len(),
            2,
            "worker {addr} should hold exactly two tasks"
        );
    }
}

#[tokio::test]
async fn test_dispatch_rolls_back_when_worker_unreachable() {
    // Nothing listens on port 9.
    let manager = manager_for(vec!["127.0.0.1:9".to_string()], SchedulerKind::RoundRobin);

    let task = Task::new("web", "nginx:latest");
    let task_id = task.id;

    manager.add_task(submission(task)).await;
    manager.send_work().await;

    // The intent is back on the queue and the placement maps are clean,
    // so the next pass re-runs placement.
    assert_eq!(manager.pending_len().await, 1);
    assert_eq!(manager.worker_for_task(task_id).await, None);
    assert!(manager.tasks_for_worker("127.0.0.1:9").await.is_empty());
}

#[tokio::test]
async fn test_completed_event_for_running_task_stops_it() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr.clone()], SchedulerKind::RoundRobin);

    let task = Task::new("web", "nginx:latest");
    let task_id = task.id;
    manager.add_task(submission(task.clone())).await;
    manager.send_work().await;

    // The worker reports the task running.
    let mut running = task.clone();
    running.state = TaskState::Running;
    running.container_id = Some("c1".to_string());
    stub.set_tasks(vec![running]).await;
    manager.reconcile_tasks().await;
    assert_eq!(
        manager.get_task(task_id).await.unwrap().state,
        TaskState::Running
    );

    // A completion intent for a running task turns into a stop request.
    manager
        .add_task(TaskEvent::new(TaskState::Completed, task))
        .await;
    manager.send_work().await;

    let deletes = stub.deletes.lock().await;
    assert_eq!(*deletes, vec![task_id]);
}

#[tokio::test]
async fn test_completed_event_for_unplaced_task_is_rejected() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr.clone()], SchedulerKind::RoundRobin);

    // Asking for completion of a task that was never placed is an invalid
    // transition; no placement happens and the store stays clean.
    let task = Task::new("ghost", "nginx:latest");
    let task_id = task.id;
    manager
        .add_task(TaskEvent::new(TaskState::Completed, task))
        .await;
    manager.send_work().await;

    assert!(manager.get_task(task_id).await.is_none());
    assert_eq!(manager.worker_for_task(task_id).await, None);
    assert!(manager.tasks_for_worker(&addr).await.is_empty());
    assert!(stub.posts.lock().await.is_empty());
}

#[tokio::test]
async fn test_completed_event_for_scheduled_task_is_dropped() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr.clone()], SchedulerKind::RoundRobin);

    let task = Task::new("web", "nginx:latest");
    let task_id = task.id;
    manager.add_task(submission(task.clone())).await;
    manager.send_work().await;

    // Scheduled -> Completed is not a legal transition; the event is
    // dropped without touching the worker.
    manager
        .add_task(TaskEvent::new(TaskState::Completed, task))
        .await;
    manager.send_work().await;

    assert!(stub.deletes.lock().await.is_empty());
    assert_eq!(
        manager.get_task(task_id).await.unwrap().state,
        TaskState::Scheduled
    );
    assert_eq!(manager.worker_for_task(task_id).await, Some(addr));
}

#[tokio::test]
async fn test_reconcile_adopts_worker_state_and_is_idempotent() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr], SchedulerKind::RoundRobin);

    let task = Task::new("web", "nginx:latest");
    let task_id = task.id;
    manager.add_task(submission(task.clone())).await;
    manager.send_work().await;

    let mut running = task.clone();
    running.state = TaskState::Running;
    running.container_id = Some("c1".to_string());
    running.start_time = Some(chrono::Utc::now());
    running.host_ports.insert(
        "80/tcp".to_string(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some("49153".to_string()),
        }]),
    );
    stub.set_tasks(vec![running.clone()]).await;

    manager.reconcile_tasks().await;
    let after_first = manager.get_task(task_id).await.unwrap();
    assert_eq!(after_first.state, TaskState::Running);
    assert_eq!(after_first.container_id, Some("c1".to_string()));
    assert_eq!(after_first.start_time, running.start_time);
    assert!(!after_first.host_ports.is_empty());

    // A second pass with no worker-side change makes no manager-side
    // change.
    manager.reconcile_tasks().await;
    let after_second = manager.get_task(task_id).await.unwrap();
    assert_eq!(
        serde_json::to_value(&after_first).unwrap(),
        serde_json::to_value(&after_second).unwrap()
    );
}

#[tokio::test]
async fn test_failing_health_check_restarts_until_cap() {
    let stub = StubWorker::new(500);
    let addr = spawn_stub(stub.clone()).await;
    let port = addr.rsplit(':').next().unwrap().to_string();
    let manager = manager_for(vec![addr], SchedulerKind::RoundRobin);

    let mut task = Task::new("web", "nginx:latest");
    task.health_check = Some("/health".to_string());
    let task_id = task.id;
    manager.add_task(submission(task.clone())).await;
    manager.send_work().await;

    // The worker reports the task running, published on the stub's own
    // port so health probes land on the stub.
    let mut running = task.clone();
    running.state = TaskState::Running;
    running.container_id = Some("c1".to_string());
    running.host_ports.insert(
        "80/tcp".to_string(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(port),
        }]),
    );

    for expected_count in 1..=3u32 {
        stub.set_tasks(vec![running.clone()]).await;
        manager.reconcile_tasks().await;
        manager.run_health_checks().await;

        let persisted = manager.get_task(task_id).await.unwrap();
        assert_eq!(persisted.restart_count, expected_count);
        assert_eq!(persisted.state, TaskState::Scheduled);
        // One placement post plus one post per restart.
        assert_eq!(stub.posts.lock().await.len(), 1 + expected_count as usize);
    }

    // At the cap the task is left alone.
    stub.set_tasks(vec![running.clone()]).await;
    manager.reconcile_tasks().await;
    manager.run_health_checks().await;

    let persisted = manager.get_task(task_id).await.unwrap();
    assert_eq!(persisted.restart_count, 3);
    assert_eq!(stub.posts.lock().await.len(), 4);
}

#[tokio::test]
async fn test_failed_task_is_restarted_without_probing() {
    let stub = StubWorker::new(200);
    let addr = spawn_stub(stub.clone()).await;
    let manager = manager_for(vec![addr], SchedulerKind::RoundRobin);

    let task = Task::new("web", "nginx:latest");
    let task_id = task.id;
    manager.add_task(submission(task.clone())).await;
    manager.send_work().await;

    let mut failed = task.clone();
    failed.state = TaskState::Failed;
    stub.set_tasks(vec![failed]).await;
    manager.reconcile_tasks().await;

    manager.run_health_checks().await;

    let persisted = manager.get_task(task_id).await.unwrap();
    assert_eq!(persisted.state, TaskState::Scheduled);
    assert_eq!(persisted.restart_count, 1);
}

#[tokio::test]
async fn test_select_worker_fails_without_candidates() {
    // Greedy filters on disk; the node has none to offer until its stats
    // arrive.
    let manager = manager_for(vec!["127.0.0.1:9".to_string()], SchedulerKind::Greedy);

    let mut task = Task::new("big", "nginx:latest");
    task.disk = 1_000_000_000;

    let err = manager.select_worker(&task).await.unwrap_err();
    assert!(matches!(err, CubeError::NoCandidates(id) if id == task.id));
}

#[test]
fn test_first_host_port_is_deterministic() {
    let binding = |port: &str| {
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(port.to_string()),
        }])
    };

    let mut forward = PortMap::new();
    forward.insert("443/tcp".to_string(), binding("9443"));
    forward.insert("80/tcp".to_string(), binding("9080"));

    let mut reverse = PortMap::new();
    reverse.insert("80/tcp".to_string(), binding("9080"));
    reverse.insert("443/tcp".to_string(), binding("9443"));

    // Sorted by container port key, "443/tcp" precedes "80/tcp".
    assert_eq!(first_host_port(&forward), Some("9443".to_string()));
    assert_eq!(first_host_port(&forward), first_host_port(&reverse));

    let mut unbound = PortMap::new();
    unbound.insert("80/tcp".to_string(), None);
    assert_eq!(first_host_port(&unbound), None);
    assert_eq!(first_host_port(&PortMap::new()), None);
}
