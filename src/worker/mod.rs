//! Worker core: runs containerized tasks and reports their state.
//!
//! The worker accepts task events over its API into an intake queue, and a
//! set of loops drives everything else:
//!
//! 1. [`Worker::run_tasks`] drains the queue and walks each task through
//!    the state machine via the container driver
//! 2. [`Worker::collect_stats`] refreshes the host snapshot served at
//!    `/stats`
//! 3. [`Worker::update_tasks`] reconciles the store against what the
//!    container engine actually reports
//!
//! The worker's store is the source of truth for runtime task state; the
//! manager polls it and never writes here.

pub mod api;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{DbKind, WorkerConfig};
use crate::docker::{Docker, DockerError, TaskConfig};
use crate::error::{CubeError, Result};
use crate::stats::Stats;
use crate::store::{MemoryStore, SledStore, Store};
use crate::task::{valid_state_transition, State, Task};

const IDLE_SLEEP: Duration = Duration::from_secs(10);
const STATS_INTERVAL: Duration = Duration::from_secs(15);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

pub struct Worker {
    pub name: String,
    queue: Mutex<VecDeque<Task>>,
    db: Arc<dyn Store<Task>>,
    docker: Docker,
    stats: RwLock<Stats>,
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let db: Arc<dyn Store<Task>> = match config.db_type {
            DbKind::Memory => Arc::new(MemoryStore::new()),
            DbKind::Persistent => {
                Arc::new(SledStore::open(format!("{}_tasks.db", config.name), "tasks")?)
            }
        };

        Ok(Self {
            name: config.name.clone(),
            queue: Mutex::new(VecDeque::new()),
            db,
            docker: Docker::new()?,
            stats: RwLock::new(Stats::default()),
        })
    }

    /// Enqueue a task for the execution loop. The API is the only caller.
    pub async fn add_task(&self, task: Task) {
        self.queue.lock().await.push_back(task);
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.db.get(&task_id.to_string()).await.ok()
    }

    pub async fn get_tasks(&self) -> Vec<Task> {
        match self.db.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "error listing tasks");
                Vec::new()
            }
        }
    }

    pub async fn stats_snapshot(&self) -> Stats {
        self.stats.read().await.clone()
    }

    /// Execution loop: drain the intake queue, sleeping when it is empty.
    pub async fn run_tasks(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let next = self.queue.lock().await.pop_front();
            match next {
                Some(task) => {
                    if let Err(e) = self.run_task(task).await {
                        tracing::error!(error = %e, "error running task");
                    }
                }
                None => {
                    tracing::debug!("no tasks to process");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                }
            }
            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Drive one dequeued task through the state machine.
    async fn run_task(&self, queued: Task) -> Result<()> {
        tracing::info!(task_id = %queued.id, desired = %queued.state, "found task in queue");
        let key = queued.id.to_string();

        self.db.put(&key, queued.clone()).await?;
        let persisted = self.db.get(&key).await?;

        if persisted.state == State::Completed {
            return self.stop_task(persisted).await;
        }

        if !valid_state_transition(persisted.state, queued.state) {
            return Err(CubeError::InvalidTransition(persisted.state, queued.state));
        }

        match queued.state {
            State::Scheduled => self.start_task(queued).await,
            State::Completed => self.stop_task(queued).await,
            state => Err(CubeError::Internal(format!(
                "unreachable desired state {state} for task {}",
                queued.id
            ))),
        }
    }

    /// Start the task's container, persisting `Running` on success and
    /// `Failed` on driver error.
    async fn start_task(&self, mut task: Task) -> Result<()> {
        task.start_time = Some(Utc::now());
        let config = TaskConfig::from_task(&task);
        let key = task.id.to_string();

        match self.docker.run(&config).await {
            Ok(result) => {
                task.container_id = result.container_id;
                task.state = State::Running;
                self.db.put(&key, task).await?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "error running task container");
                task.state = State::Failed;
                self.db.put(&key, task).await?;
                Err(CubeError::Driver(e))
            }
        }
    }

    /// Stop and remove the task's container. Driver failures are logged
    /// but the task still advances to `Completed` so it cannot get stuck
    /// stopping.
    async fn stop_task(&self, mut task: Task) -> Result<()> {
        let container_id = task.container_id.clone().unwrap_or_default();

        if let Err(e) = self.docker.stop(&container_id).await {
            tracing::error!(container_id = %container_id, error = %e, "error stopping container");
        }

        task.finish_time = Some(Utc::now());
        task.state = State::Completed;
        self.db.put(&task.id.to_string(), task.clone()).await?;
        tracing::info!(container_id = %container_id, task_id = %task.id, "stopped and removed container");
        Ok(())
    }

    pub async fn inspect_task(&self, task: &Task) -> Result<ContainerInspectResponse> {
        let container_id = task.container_id.clone().unwrap_or_default();
        Ok(self.docker.inspect(&container_id).await?)
    }

    /// Refresh the shared host snapshot served at `/stats`.
    pub async fn collect_stats(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tracing::debug!("collecting stats");
            let task_count = self.running_task_count().await;
            let snapshot =
                match tokio::task::spawn_blocking(move || Stats::collect(task_count)).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::error!(error = %e, "stats collection task failed");
                        Stats::default()
                    }
                };
            *self.stats.write().await = snapshot;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(STATS_INTERVAL) => {}
            }
        }
    }

    /// Self-reconciliation loop: the container engine is the truth for
    /// running tasks.
    pub async fn update_tasks(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tracing::debug!("checking status of tasks");
            self.reconcile_tasks().await;

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
        }
    }

    async fn reconcile_tasks(&self) {
        let tasks = match self.db.list().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "error listing tasks");
                return;
            }
        };

        for mut task in tasks {
            if task.state != State::Running {
                continue;
            }
            let key = task.id.to_string();

            match self.inspect_task(&task).await {
                Ok(resp) => {
                    let status = resp.state.as_ref().and_then(|s| s.status);
                    if status == Some(ContainerStateStatusEnum::EXITED) {
                        tracing::warn!(task_id = %task.id, "container for running task has exited");
                        task.state = State::Failed;
                        if let Err(e) = self.db.put(&key, task).await {
                            tracing::error!(error = %e, "error persisting failed task");
                        }
                        continue;
                    }

                    task.host_ports = resp
                        .network_settings
                        .and_then(|ns| ns.ports)
                        .unwrap_or_default();
                    if let Err(e) = self.db.put(&key, task).await {
                        tracing::error!(error = %e, "error persisting task ports");
                    }
                }
                Err(CubeError::Driver(DockerError::Inspect { ref source, .. }))
                    if is_missing_container(source) =>
                {
                    tracing::warn!(task_id = %task.id, "no container for running task");
                    task.state = State::Failed;
                    if let Err(e) = self.db.put(&key, task).await {
                        tracing::error!(error = %e, "error persisting failed task");
                    }
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "error inspecting container");
                }
            }
        }
    }

    async fn running_task_count(&self) -> usize {
        match self.db.list().await {
            Ok(tasks) => tasks.iter().filter(|t| t.state == State::Running).count(),
            Err(_) => 0,
        }
    }
}

fn is_missing_container(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
