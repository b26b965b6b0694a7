use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::node::{Node, NodeSnapshot};
use crate::scheduler::{calculate_cpu_usage, cpu_load, filter_by_disk, Scheduler};
use crate::task::Task;

/// Lieb's square-ice constant, the base of the load penalty.
pub const LIEB: f64 = 1.539_600_717_839_002_038_69;

/// Per-node job ceiling used in the job-pressure terms.
pub const MAX_JOBS: f64 = 4.0;

/// Scores a placement by the marginal increase of a convex per-node load
/// penalty (the E-PVM model).
pub struct Epvm;

impl Epvm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Epvm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for Epvm {
    fn name(&self) -> &'static str {
        "epvm"
    }

    async fn select_candidate_nodes(&self, task: &Task, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        filter_by_disk(task, nodes).await
    }

    async fn score(&self, task: &Task, candidates: &[Arc<Node>]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();
        for node in candidates {
            let usage = match calculate_cpu_usage(node).await {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(node = %node.name, error = %e, "cpu probe failed, skipping node");
                    continue;
                }
            };
            let snapshot = node.snapshot().await;
            scores.insert(node.name.clone(), score_node(usage, &snapshot, task));
        }
        scores
    }
}

/// Marginal cost of adding `task` to a node in state `snapshot` given its
/// measured CPU utilisation.
///
/// The two `cpu_load` terms cancel algebraically; the expanded form is
/// kept on purpose. Task memory arrives in bytes and is scaled by 1000
/// onto the kilobyte-denominated allocation figures.
pub fn score_node(cpu_usage: f64, snapshot: &NodeSnapshot, task: &Task) -> f64 {
    let cpu_load = cpu_load(cpu_usage);

    let memory_allocated = snapshot.stats.mem_used_kb() as f64 + snapshot.memory_allocated as f64;
    let memory_percent_allocated = memory_allocated / snapshot.memory as f64;
    let new_mem_percent =
        (memory_allocated + (task.memory / 1000) as f64) / snapshot.memory as f64;

    let task_count = snapshot.task_count as f64;
    let job_percent = task_count / MAX_JOBS;
    let new_job_percent = (task_count + 1.0) / MAX_JOBS;

    let mem_cost = LIEB.powf(new_mem_percent) + LIEB.powf(new_job_percent)
        - LIEB.powf(memory_percent_allocated)
        - LIEB.powf(job_percent);
    let cpu_cost = LIEB.powf(cpu_load) + LIEB.powf(new_job_percent)
        - LIEB.powf(cpu_load)
        - LIEB.powf(job_percent);

    mem_cost + cpu_cost
}
