//! Placement policies.
//!
//! A scheduler answers three questions for one task against the manager's
//! node list: which nodes are feasible, what does each candidate cost, and
//! which candidate wins. Costs are minimised for every policy.
//!
//! # Components
//!
//! - [`RoundRobin`]: rotating cursor, no feasibility filtering
//! - [`Greedy`]: lowest observed CPU load among disk-feasible nodes
//! - [`Epvm`]: marginal increase of a convex per-node load penalty

pub mod epvm;
pub mod greedy;
pub mod round_robin;

pub use epvm::Epvm;
pub use greedy::Greedy;
pub use round_robin::RoundRobin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SchedulerKind;
use crate::error::Result;
use crate::node::Node;
use crate::task::Task;

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Filter `nodes` down to those that can feasibly take `task`.
    async fn select_candidate_nodes(&self, task: &Task, nodes: &[Arc<Node>]) -> Vec<Arc<Node>>;

    /// Cost per candidate, keyed by node name. Lower is better. A node
    /// absent from the map (for example because its stats probe failed)
    /// must not be picked.
    async fn score(&self, task: &Task, candidates: &[Arc<Node>]) -> HashMap<String, f64>;

    /// The candidate with the minimum score; ties broken by first-seen
    /// order in `candidates`.
    fn pick(
        &self,
        scores: &HashMap<String, f64>,
        candidates: &[Arc<Node>],
    ) -> Option<Arc<Node>> {
        pick_lowest(scores, candidates)
    }
}

pub fn new_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Epvm => Box::new(Epvm::new()),
        SchedulerKind::Greedy => Box::new(Greedy::new()),
        SchedulerKind::RoundRobin => Box::new(RoundRobin::new()),
    }
}

/// Minimum-score candidate, first-seen tie-break, skipping candidates
/// without a score.
pub fn pick_lowest(
    scores: &HashMap<String, f64>,
    candidates: &[Arc<Node>],
) -> Option<Arc<Node>> {
    let mut best: Option<(&Arc<Node>, f64)> = None;
    for node in candidates {
        let Some(&score) = scores.get(&node.name) else {
            continue;
        };
        match best {
            Some((_, lowest)) if score >= lowest => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| Arc::clone(node))
}

/// A node is feasible iff the task's disk request fits in what placement
/// has not already claimed.
pub async fn filter_by_disk(task: &Task, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
    let mut candidates = Vec::new();
    for node in nodes {
        let snapshot = node.snapshot().await;
        let available = snapshot.disk.saturating_sub(snapshot.disk_allocated);
        if task.disk.max(0) as u64 <= available {
            candidates.push(Arc::clone(node));
        }
    }
    candidates
}

/// Scale raw CPU utilisation into the load figure the scoring formulas
/// consume.
pub fn cpu_load(usage: f64) -> f64 {
    usage / 2f64.powf(0.8)
}

/// Fractional CPU utilisation of `node` over a 3-second window, from two
/// stats snapshots. Blocks the caller for the window; scoring N nodes is
/// O(N) in wall time.
pub async fn calculate_cpu_usage(node: &Node) -> Result<f64> {
    let stat1 = node.get_stats().await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let stat2 = node.get_stats().await?;

    let (_, idle1, _, total1) = stat1.cpu_usage();
    let (_, idle2, _, total2) = stat2.cpu_usage();

    let total = total2 - total1;
    let idle = idle2 - idle1;

    if total == 0.0 && idle == 0.0 {
        Ok(0.0)
    } else {
        Ok((total - idle) / total)
    }
}
