//! Per-leaf packet statistics.

use std::sync::Arc;

use ceetm_qman::{DequeueStats, QmanApi, QmanResult};
use serde::Serialize;

use crate::hierarchy::{Hierarchy, Level, NodeId, SchedulingNode};

/// Packets a leaf admitted and dropped since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Counters {
    pub enqueued: u64,
    pub dropped: u64,
}

/// Statistics of one bound leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafReport {
    pub node: NodeId,
    pub level: Level,
    pub counters: Counters,
    /// What the hardware transmitted from the class queue.
    pub dequeued: DequeueStats,
}

/// Reads leaf counters and the matching hardware dequeue counters.
pub struct StatsAggregator {
    qman: Arc<dyn QmanApi>,
}

impl std::fmt::Debug for StatsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsAggregator").finish_non_exhaustive()
    }
}

impl StatsAggregator {
    pub fn new(qman: Arc<dyn QmanApi>) -> Self {
        Self { qman }
    }

    /// Returns the leaf's counters and zeroes them. Unbound and non-leaf
    /// nodes read as zero.
    pub fn read_and_reset(&self, node: &SchedulingNode) -> Counters {
        node.binding()
            .and_then(|b| b.as_queue())
            .map(|queue| queue.state.drain())
            .unwrap_or_default()
    }

    /// Returns the leaf's counters without resetting them.
    pub fn peek(&self, node: &SchedulingNode) -> Counters {
        node.binding()
            .and_then(|b| b.as_queue())
            .map(|queue| queue.state.counters())
            .unwrap_or_default()
    }

    pub fn dequeue_stats(&self, node: &SchedulingNode) -> QmanResult<DequeueStats> {
        match node.binding().and_then(|b| b.as_queue()) {
            Some(queue) => self.qman.dequeue_stats(queue.class_queue, false),
            None => Ok(DequeueStats::default()),
        }
    }

    /// Reports every bound leaf of the hierarchy, sorted by id.
    pub fn report(&self, hierarchy: &Hierarchy) -> Vec<LeafReport> {
        let mut reports: Vec<LeafReport> = hierarchy
            .walk()
            .filter(|node| node.is_leaf() && node.is_bound())
            .map(|node| LeafReport {
                node: node.id(),
                level: node.level(),
                counters: self.peek(node),
                dequeued: self.dequeue_stats(node).unwrap_or_default(),
            })
            .collect();
        reports.sort_by_key(|r| r.node);
        reports
    }
}
