//! Remote worker handle held by the manager.
//!
//! A `Node` is created at manager startup from the static worker list and
//! never destroyed at runtime. Its capacity snapshot is refreshed by the
//! manager's node-stats loop and adjusted by placement; the schedulers
//! read it when filtering and scoring.

use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::{CubeError, Result};
use crate::stats::Stats;
use crate::task::Task;

const STATS_RETRIES: u32 = 3;
const STATS_RETRY_DELAY: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Mutable view of a node's capacity and load.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub cores: usize,
    /// Total memory in kilobytes, from the last stats fetch.
    pub memory: u64,
    /// Kilobytes of memory requested by tasks placed here.
    pub memory_allocated: u64,
    /// Total disk in bytes, from the last stats fetch.
    pub disk: u64,
    /// Bytes of disk requested by tasks placed here.
    pub disk_allocated: u64,
    pub task_count: usize,
    /// Last-known host snapshot; a strictly downstream copy of the
    /// worker's own view.
    pub stats: Stats,
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    /// Base URL of the worker API, e.g. `http://localhost:5556`.
    pub api: String,
    pub role: String,
    state: RwLock<NodeSnapshot>,
    client: reqwest::Client,
}

impl Node {
    pub fn new(name: impl Into<String>, api: impl Into<String>, role: impl Into<String>) -> Self {
        Self::with_snapshot(name, api, role, NodeSnapshot::default())
    }

    /// Construct a node with a pre-populated snapshot. Used by tests and
    /// anywhere capacity is known ahead of the first stats fetch.
    pub fn with_snapshot(
        name: impl Into<String>,
        api: impl Into<String>,
        role: impl Into<String>,
        snapshot: NodeSnapshot,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self {
            name: name.into(),
            api: api.into(),
            role: role.into(),
            state: RwLock::new(snapshot),
            client,
        }
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        self.state.read().await.clone()
    }

    /// Fetch `/stats` from the worker, refreshing the cached snapshot and
    /// the node's memory/disk capacity.
    ///
    /// Transient transport errors are retried a few times before the fetch
    /// is reported as failed; the prior snapshot is retained in that case.
    pub async fn get_stats(&self) -> Result<Stats> {
        let url = format!("{}/stats", self.api);

        let mut last_err: Option<reqwest::Error> = None;
        for attempt in 0..STATS_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(STATS_RETRY_DELAY).await;
            }
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        return Err(CubeError::NodeStats {
                            node: self.name.clone(),
                            reason: format!("stats request returned {}", resp.status()),
                        });
                    }
                    let stats: Stats = resp.json().await?;
                    if stats.mem_total_kb() == 0 || stats.disk_total() == 0 {
                        return Err(CubeError::NodeStats {
                            node: self.name.clone(),
                            reason: "stats payload has zeroed totals".to_string(),
                        });
                    }

                    let mut state = self.state.write().await;
                    state.memory = stats.mem_total_kb();
                    state.disk = stats.disk_total();
                    state.stats = stats.clone();
                    return Ok(stats);
                }
                Err(e) => {
                    tracing::warn!(node = %self.name, attempt, error = %e, "stats fetch failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => CubeError::Transport(e),
            None => CubeError::NodeStats {
                node: self.name.clone(),
                reason: "stats fetch failed".to_string(),
            },
        })
    }

    /// Account for a task successfully dispatched to this node.
    pub async fn record_placement(&self, task: &Task) {
        let mut state = self.state.write().await;
        state.task_count += 1;
        state.memory_allocated += (task.memory.max(0) / 1000) as u64;
        state.disk_allocated += task.disk.max(0) as u64;
    }
}
