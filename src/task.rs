//! Task model: lifecycle states, the legal-transition table, and the
//! event type that carries placement and transition intents.

use std::collections::HashMap;

use bollard::models::PortMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// `Completed`, `Stopped` and `Failed` are terminal. A restart does not
/// transition out of `Failed`; it is a new scheduling event for the same
/// task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Pending,
    Scheduled,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Pending => write!(f, "pending"),
            State::Scheduled => write!(f, "scheduled"),
            State::Running => write!(f, "running"),
            State::Completed => write!(f, "completed"),
            State::Stopped => write!(f, "stopped"),
            State::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a task may move from `src` to `dst`.
///
/// Any write that would violate this table is rejected at the worker and
/// logged at the manager.
pub fn valid_state_transition(src: State, dst: State) -> bool {
    match src {
        State::Pending => matches!(dst, State::Scheduled),
        State::Scheduled => matches!(dst, State::Scheduled | State::Running | State::Failed),
        State::Running => matches!(dst, State::Running | State::Completed | State::Failed),
        State::Completed | State::Stopped | State::Failed => false,
    }
}

/// Container restart policy requested for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure,
    Always,
    UnlessStopped,
}

/// The unit of work: one container, one lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub state: State,
    pub image: String,
    /// Empty until the container driver assigns one.
    pub container_id: Option<String>,
    /// Fractional cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: i64,
    /// Bytes.
    pub disk: i64,
    /// Port/protocol pairs, e.g. "80/tcp".
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    /// Container-to-host mapping; empty means publish all.
    #[serde(default)]
    pub port_bindings: HashMap<String, String>,
    /// Filled in by the manager after inspection; authoritative.
    #[serde(default)]
    pub host_ports: PortMap,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    /// URL path probed by the manager's health checks.
    pub health_check: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
}

impl Task {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            state: State::Pending,
            image: String::new(),
            container_id: None,
            cpu: 0.0,
            memory: 0,
            disk: 0,
            exposed_ports: Vec::new(),
            port_bindings: HashMap::new(),
            host_ports: PortMap::new(),
            restart_policy: RestartPolicy::No,
            start_time: None,
            finish_time: None,
            health_check: None,
            restart_count: 0,
        }
    }
}

/// A durable record of an intended state transition for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// The desired state.
    pub state: State,
    /// The task record as seen by the submitter.
    pub task: Task,
}

impl TaskEvent {
    pub fn new(state: State, task: Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            state,
            task,
        }
    }
}
