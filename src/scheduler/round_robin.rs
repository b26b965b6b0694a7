use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::node::Node;
use crate::scheduler::Scheduler;
use crate::task::Task;

/// Rotates through the node list, one placement per `score` call.
///
/// The cursor node is scored 0.1 and everything else 1.0, so `pick`
/// selects the cursor. The cursor is shared mutable state; the atomic
/// serialises the otherwise benign cross-tick race.
pub struct RoundRobin {
    last_worker: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            last_worker: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    async fn select_candidate_nodes(&self, _task: &Task, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        nodes.to_vec()
    }

    async fn score(&self, _task: &Task, candidates: &[Arc<Node>]) -> HashMap<String, f64> {
        if candidates.is_empty() {
            return HashMap::new();
        }

        let last = self.last_worker.load(Ordering::Relaxed);
        let next = if last + 1 < candidates.len() { last + 1 } else { 0 };
        self.last_worker.store(next, Ordering::Relaxed);

        candidates
            .iter()
            .enumerate()
            .map(|(idx, node)| {
                let score = if idx == next { 0.1 } else { 1.0 };
                (node.name.clone(), score)
            })
            .collect()
    }
}
