//! Manager core: accepts task events, places them on workers, and runs
//! the reconciliation loops.
//!
//! Four loops drive the manager:
//!
//! 1. [`Manager::process_tasks`] drains the pending queue through
//!    placement and dispatch
//! 2. [`Manager::update_tasks`] polls every worker's `/tasks` and folds
//!    runtime state into the manager's store
//! 3. [`Manager::do_health_checks`] probes running tasks and restarts
//!    unhealthy or failed ones, up to a bounded retry count
//! 4. [`Manager::update_node_stats`] refreshes node capacity for the
//!    schedulers
//!
//! Workers are the source of truth for runtime fields; the manager is the
//! source of truth for placement identity.

pub mod api;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bollard::models::PortMap;
use reqwest::StatusCode;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{DbKind, ManagerConfig};
use crate::error::{CubeError, Result};
use crate::node::Node;
use crate::scheduler::{new_scheduler, Scheduler};
use crate::store::{MemoryStore, SledStore, Store};
use crate::task::{valid_state_transition, State, Task, TaskEvent};
use crate::worker::api::ErrResponse;

const PROCESS_INTERVAL: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
const NODE_STATS_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Restart attempts per task before it is left alone.
pub const MAX_RESTARTS: u32 = 3;

pub struct Manager {
    pending: Mutex<VecDeque<TaskEvent>>,
    task_db: Arc<dyn Store<Task>>,
    event_db: Arc<dyn Store<TaskEvent>>,
    pub workers: Vec<String>,
    worker_task_map: RwLock<HashMap<String, Vec<Uuid>>>,
    task_worker_map: RwLock<HashMap<Uuid, String>>,
    pub worker_nodes: Vec<Arc<Node>>,
    scheduler: Box<dyn Scheduler>,
    client: reqwest::Client,
}

impl Manager {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let mut worker_task_map = HashMap::new();
        let mut nodes = Vec::new();
        for worker in &config.workers {
            worker_task_map.insert(worker.clone(), Vec::new());
            let api = format!("http://{worker}");
            nodes.push(Arc::new(Node::new(worker.clone(), api, "worker")));
        }

        let (task_db, event_db): (Arc<dyn Store<Task>>, Arc<dyn Store<TaskEvent>>) =
            match config.db_type {
                DbKind::Memory => (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new())),
                DbKind::Persistent => (
                    Arc::new(SledStore::open("tasks.db", "tasks")?),
                    Arc::new(SledStore::open("events.db", "events")?),
                ),
            };

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build http client");

        Ok(Self {
            pending: Mutex::new(VecDeque::new()),
            task_db,
            event_db,
            workers: config.workers.clone(),
            worker_task_map: RwLock::new(worker_task_map),
            task_worker_map: RwLock::new(HashMap::new()),
            worker_nodes: nodes,
            scheduler: new_scheduler(config.scheduler),
            client,
        })
    }

    /// Enqueue a task event for dispatch. The API is the only caller.
    pub async fn add_task(&self, event: TaskEvent) {
        self.pending.lock().await.push_back(event);
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.task_db.get(&task_id.to_string()).await.ok()
    }

    pub async fn get_tasks(&self) -> Vec<Task> {
        match self.task_db.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "error listing tasks");
                Vec::new()
            }
        }
    }

    /// The worker a task is currently mapped to, if any.
    pub async fn worker_for_task(&self, task_id: Uuid) -> Option<String> {
        self.task_worker_map.read().await.get(&task_id).cloned()
    }

    /// Task ids mapped to a worker.
    pub async fn tasks_for_worker(&self, worker: &str) -> Vec<Uuid> {
        self.worker_task_map
            .read()
            .await
            .get(worker)
            .cloned()
            .unwrap_or_default()
    }

    /// Run the bound scheduler's filter, score and pick steps. Performs no
    /// I/O beyond what the scheduler's scoring does.
    pub async fn select_worker(&self, task: &Task) -> Result<Arc<Node>> {
        let candidates = self
            .scheduler
            .select_candidate_nodes(task, &self.worker_nodes)
            .await;
        if candidates.is_empty() {
            return Err(CubeError::NoCandidates(task.id));
        }

        let scores = self.scheduler.score(task, &candidates).await;
        if scores.is_empty() {
            return Err(CubeError::NoScores(task.id));
        }

        self.scheduler
            .pick(&scores, &candidates)
            .ok_or(CubeError::NoScores(task.id))
    }

    /// Dispatch loop.
    pub async fn process_tasks(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tracing::debug!("processing any tasks in the queue");
            self.send_work().await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(PROCESS_INTERVAL) => {}
            }
        }
    }

    /// One dispatch pass: pull one event off the pending queue, record it
    /// durably, and either forward a stop intent for an already-placed
    /// task or run placement for a new one.
    pub async fn send_work(&self) {
        let Some(event) = self.pending.lock().await.pop_front() else {
            tracing::debug!("no work in the queue");
            return;
        };

        if let Err(e) = self.event_db.put(&event.id.to_string(), event.clone()).await {
            tracing::error!(event_id = %event.id, error = %e, "error storing task event");
            return;
        }
        tracing::info!(event_id = %event.id, task_id = %event.task.id, "pulled event off pending queue");

        let assigned = self.worker_for_task(event.task.id).await;
        match assigned {
            Some(worker) => self.handle_existing_task(&worker, &event).await,
            None => self.place_task(event).await,
        }
    }

    /// An event for a task that already has a worker is only honoured as a
    /// legal stop request; everything else is dropped.
    async fn handle_existing_task(&self, worker: &str, event: &TaskEvent) {
        let persisted = match self.task_db.get(&event.task.id.to_string()).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id = %event.task.id, error = %e, "unable to schedule task");
                return;
            }
        };

        if event.state == State::Completed && valid_state_transition(persisted.state, event.state)
        {
            self.stop_remote_task(worker, event.task.id).await;
            return;
        }

        tracing::warn!(
            task_id = %persisted.id,
            state = %persisted.state,
            "invalid request: existing task cannot transition to the completed state"
        );
    }

    async fn stop_remote_task(&self, worker: &str, task_id: Uuid) {
        let url = format!("http://{worker}/tasks/{task_id}");
        match self.client.delete(&url).send().await {
            Ok(resp) if resp.status() == StatusCode::NO_CONTENT => {
                tracing::info!(task_id = %task_id, worker = %worker, "task has been scheduled to be stopped");
            }
            Ok(resp) => {
                tracing::error!(task_id = %task_id, status = %resp.status(), "error requesting task stop");
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "error connecting to worker");
            }
        }
    }

    /// Place a new task: select a worker, record the placement, persist
    /// `Scheduled`, and POST the event to the worker.
    async fn place_task(&self, event: TaskEvent) {
        // A task that has never been placed can only be asked for a state
        // the worker could legally reach once scheduled.
        if !valid_state_transition(State::Scheduled, event.state) {
            tracing::warn!(
                task_id = %event.task.id,
                desired = %event.state,
                "invalid transition: cannot place a new task with this desired state"
            );
            return;
        }

        let mut task = event.task.clone();

        let node = match self.select_worker(&task).await {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "error selecting worker for task");
                return;
            }
        };
        tracing::info!(worker = %node.name, task_id = %task.id, "selected worker for task");

        self.worker_task_map
            .write()
            .await
            .entry(node.name.clone())
            .or_default()
            .push(task.id);
        self.task_worker_map
            .write()
            .await
            .insert(task.id, node.name.clone());

        task.state = State::Scheduled;
        if let Err(e) = self.task_db.put(&task.id.to_string(), task.clone()).await {
            tracing::error!(task_id = %task.id, error = %e, "error persisting scheduled task");
            return;
        }

        // The dispatched event carries the scheduled record, not the
        // submitter's copy, so the worker sees a legal transition.
        let dispatch = TaskEvent {
            task: task.clone(),
            ..event
        };

        let url = format!("http://{}/tasks", node.name);
        let resp = match self.client.post(&url).json(&dispatch).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(worker = %node.name, error = %e, "error connecting to worker");
                // Roll the placement back so the next pass re-runs it,
                // possibly onto a different worker.
                self.unassign(&node.name, task.id).await;
                self.pending.lock().await.push_back(dispatch);
                return;
            }
        };

        if resp.status() != StatusCode::CREATED {
            match resp.json::<ErrResponse>().await {
                Ok(err) => {
                    tracing::error!(status = err.status_code, message = %err.message, "response error from worker");
                }
                Err(e) => tracing::error!(error = %e, "error decoding error response"),
            }
            return;
        }

        match resp.json::<Task>().await {
            Ok(returned) => {
                node.record_placement(&task).await;
                tracing::info!(task_id = %returned.id, worker = %node.name, "received response from worker");
            }
            Err(e) => tracing::error!(error = %e, "error decoding response"),
        }
    }

    async fn unassign(&self, worker: &str, task_id: Uuid) {
        self.task_worker_map.write().await.remove(&task_id);
        if let Some(ids) = self.worker_task_map.write().await.get_mut(worker) {
            ids.retain(|id| *id != task_id);
        }
    }

    /// State-reconciliation loop: poll workers for runtime truth.
    pub async fn update_tasks(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tracing::debug!("checking for task updates from workers");
            self.reconcile_tasks().await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
        }
    }

    /// One reconciliation pass over every worker. Idempotent: a second
    /// pass with no worker-side change makes no manager-side change.
    pub async fn reconcile_tasks(&self) {
        for worker in &self.workers {
            tracing::debug!(worker = %worker, "checking worker for task updates");
            let url = format!("http://{worker}/tasks");

            let resp = match self.client.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::error!(worker = %worker, error = %e, "error connecting to worker");
                    continue;
                }
            };
            if !resp.status().is_success() {
                tracing::error!(worker = %worker, status = %resp.status(), "error requesting task list");
                continue;
            }

            let tasks: Vec<Task> = match resp.json().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::error!(worker = %worker, error = %e, "error unmarshalling tasks");
                    continue;
                }
            };

            for task in tasks {
                self.update_task_from_worker(task).await;
            }
        }
    }

    async fn update_task_from_worker(&self, task: Task) {
        let key = task.id.to_string();
        let mut persisted = match self.task_db.get(&key).await {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "no persisted copy of task");
                return;
            }
        };

        if persisted.state != task.state {
            persisted.state = task.state;
        }
        persisted.start_time = task.start_time;
        persisted.finish_time = task.finish_time;
        persisted.container_id = task.container_id;
        persisted.host_ports = task.host_ports;

        if let Err(e) = self.task_db.put(&key, persisted).await {
            tracing::error!(task_id = %task.id, error = %e, "error persisting task update");
        }
    }

    /// Node-capacity loop for the schedulers.
    pub async fn update_node_stats(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            for node in &self.worker_nodes {
                tracing::debug!(node = %node.name, "collecting stats for node");
                if let Err(e) = node.get_stats().await {
                    tracing::error!(node = %node.name, error = %e, "error updating node stats");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(NODE_STATS_INTERVAL) => {}
            }
        }
    }

    /// Health-check loop.
    pub async fn do_health_checks(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tracing::debug!("performing task health checks");
            self.run_health_checks().await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
            }
        }
    }

    /// One health-check pass: probe running tasks and restart unhealthy or
    /// failed ones while they remain under the restart cap.
    pub async fn run_health_checks(&self) {
        for mut task in self.get_tasks().await {
            if task.state == State::Running && task.restart_count < MAX_RESTARTS {
                if let Err(e) = self.check_task_health(&task).await {
                    tracing::warn!(task_id = %task.id, error = %e, "task failed health check");
                    self.restart_task(&mut task).await;
                }
            } else if task.state == State::Failed && task.restart_count < MAX_RESTARTS {
                self.restart_task(&mut task).await;
            }
        }
    }

    /// Probe a task's health endpoint through its first published host
    /// port. A task whose port has not propagated yet, or that declares no
    /// health check, is treated as healthy.
    pub async fn check_task_health(&self, task: &Task) -> Result<()> {
        let Some(health_path) = task.health_check.as_deref() else {
            return Ok(());
        };

        let Some(worker) = self.worker_for_task(task.id).await else {
            return Err(CubeError::HealthCheck {
                task_id: task.id,
                reason: "task has no assigned worker".to_string(),
            });
        };

        let Some(host_port) = first_host_port(&task.host_ports) else {
            tracing::warn!(task_id = %task.id, "host port not collected yet, skipping health check");
            return Ok(());
        };

        let host = worker.split(':').next().unwrap_or("");
        let url = format!("http://{host}:{host_port}{health_path}");
        tracing::info!(task_id = %task.id, url = %url, "calling health check");

        let resp =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| CubeError::HealthCheck {
                    task_id: task.id,
                    reason: format!("error connecting to {url}: {e}"),
                })?;

        if resp.status() != StatusCode::OK {
            return Err(CubeError::HealthCheck {
                task_id: task.id,
                reason: format!("health check returned {}", resp.status()),
            });
        }

        Ok(())
    }

    /// Re-run a task on the worker it was originally placed on. The
    /// pending queue and the scheduler are bypassed to keep affinity with
    /// the known container host.
    pub async fn restart_task(&self, task: &mut Task) {
        let Some(worker) = self.worker_for_task(task.id).await else {
            tracing::error!(task_id = %task.id, "no worker assigned to task, cannot restart");
            return;
        };

        task.state = State::Scheduled;
        task.restart_count += 1;
        if let Err(e) = self.task_db.put(&task.id.to_string(), task.clone()).await {
            tracing::error!(task_id = %task.id, error = %e, "error persisting task for restart");
            return;
        }

        let event = TaskEvent::new(State::Running, task.clone());
        let url = format!("http://{worker}/tasks");
        let resp = match self.client.post(&url).json(&event).send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(worker = %worker, error = %e, "error connecting to worker");
                self.pending.lock().await.push_back(event);
                return;
            }
        };

        if resp.status() != StatusCode::CREATED {
            match resp.json::<ErrResponse>().await {
                Ok(err) => {
                    tracing::error!(status = err.status_code, message = %err.message, "response error from worker");
                }
                Err(e) => tracing::error!(error = %e, "error decoding error response"),
            }
            return;
        }

        match resp.json::<Task>().await {
            Ok(returned) => {
                tracing::info!(
                    task_id = %returned.id,
                    restart_count = task.restart_count,
                    worker = %worker,
                    "restarted task"
                );
            }
            Err(e) => tracing::error!(error = %e, "error decoding response"),
        }
    }
}

/// First host port of a published-port map, by sorted container-port key.
/// Deterministic where the engine's map iteration is not.
pub fn first_host_port(ports: &PortMap) -> Option<String> {
    let mut keys: Vec<&String> = ports.keys().collect();
    keys.sort();

    for key in keys {
        if let Some(Some(bindings)) = ports.get(key) {
            if let Some(port) = bindings.first().and_then(|b| b.host_port.clone()) {
                return Some(port);
            }
        }
    }
    None
}
