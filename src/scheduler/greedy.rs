use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::node::Node;
use crate::scheduler::{calculate_cpu_usage, cpu_load, filter_by_disk, Scheduler};
use crate::task::Task;

/// Places on the candidate with the lowest observed CPU load.
pub struct Greedy;

impl Greedy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Greedy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for Greedy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    async fn select_candidate_nodes(&self, task: &Task, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        filter_by_disk(task, nodes).await
    }

    async fn score(&self, _task: &Task, candidates: &[Arc<Node>]) -> HashMap<String, f64> {
        let mut scores = HashMap::new();
        for node in candidates {
            match calculate_cpu_usage(node).await {
                Ok(usage) => {
                    scores.insert(node.name.clone(), cpu_load(usage));
                }
                Err(e) => {
                    tracing::warn!(node = %node.name, error = %e, "cpu probe failed, skipping node");
                }
            }
        }
        scores
    }
}
