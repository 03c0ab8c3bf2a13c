//! Congestion state shared between the hardware event path and the packet path.
//!
//! Each bound leaf owns one [`CongestionState`]. The tracker indexes it twice,
//! by the congestion group that reports on it and by the frame queue that
//! feeds it, so both kinds of hardware notification find the leaf without
//! touching the hierarchy lock. The flag is the last notified state: a packet
//! that reads it just before a transition is still handed to the hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ceetm_qman::{CcgOid, CongestionListener, FrameQueueOid};
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::stats::Counters;

/// Per-leaf congestion flag and packet counters.
#[derive(Debug, Default)]
pub struct CongestionState {
    congested: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl CongestionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }

    /// Stores the flag and returns the previous value.
    pub fn set_congested(&self, congested: bool) -> bool {
        self.congested.swap(congested, Ordering::AcqRel)
    }

    pub fn record_enqueue(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves a frame accepted earlier over to the dropped counter.
    pub fn record_rejected(&self) {
        let _ = self
            .enqueued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Returns the counters and zeroes them.
    pub fn drain(&self) -> Counters {
        Counters {
            enqueued: self.enqueued.swap(0, Ordering::Relaxed),
            dropped: self.dropped.swap(0, Ordering::Relaxed),
        }
    }
}

/// Routes congestion notifications to the leaf states.
#[derive(Debug, Default)]
pub struct CongestionTracker {
    by_group: DashMap<CcgOid, Arc<CongestionState>>,
    by_queue: DashMap<FrameQueueOid, Arc<CongestionState>>,
    unmatched: AtomicU64,
}

impl CongestionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts routing events of `ccg` and `fq` to `state`.
    pub fn register(&self, ccg: CcgOid, fq: FrameQueueOid, state: Arc<CongestionState>) {
        self.by_group.insert(ccg, Arc::clone(&state));
        self.by_queue.insert(fq, state);
    }

    /// Stops routing events for a released leaf.
    pub fn unregister(&self, ccg: CcgOid, fq: FrameQueueOid) -> bool {
        let group = self.by_group.remove(&ccg).is_some();
        let queue = self.by_queue.remove(&fq).is_some();
        group && queue
    }

    pub fn on_congestion_change(&self, ccg: CcgOid, congested: bool) {
        match self.by_group.get(&ccg) {
            Some(state) => {
                let was = state.set_congested(congested);
                if was != congested {
                    debug!(%ccg, congested, "congestion state changed");
                }
            }
            None => {
                // group released while the event was in flight
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                trace!(%ccg, congested, "congestion event for unknown group ignored");
            }
        }
    }

    pub fn on_enqueue_rejected(&self, fq: FrameQueueOid) {
        match self.by_queue.get(&fq) {
            Some(state) => state.record_rejected(),
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                trace!(%fq, "reject event for unknown frame queue ignored");
            }
        }
    }

    /// Unknown groups read as not congested.
    pub fn is_congested(&self, ccg: CcgOid) -> bool {
        self.by_group
            .get(&ccg)
            .map(|state| state.is_congested())
            .unwrap_or(false)
    }

    pub fn tracked_leaves(&self) -> usize {
        self.by_queue.len()
    }

    /// Events that named a group or queue no longer tracked.
    pub fn unmatched_events(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

impl CongestionListener for CongestionTracker {
    fn on_congestion_change(&self, ccg: CcgOid, congested: bool) {
        CongestionTracker::on_congestion_change(self, ccg, congested)
    }

    fn on_enqueue_rejected(&self, fq: FrameQueueOid) {
        CongestionTracker::on_enqueue_rejected(self, fq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(raw: u64) -> (CcgOid, FrameQueueOid) {
        (
            CcgOid::from_raw(raw).unwrap(),
            FrameQueueOid::from_raw(raw + 1).unwrap(),
        )
    }

    #[test]
    fn test_congestion_toggles_leaf_state() {
        let tracker = CongestionTracker::new();
        let (ccg, fq) = ids(0x10);
        let state = Arc::new(CongestionState::new());
        tracker.register(ccg, fq, Arc::clone(&state));

        tracker.on_congestion_change(ccg, true);
        assert!(state.is_congested());
        assert!(tracker.is_congested(ccg));
        tracker.on_congestion_change(ccg, false);
        assert!(!state.is_congested());
    }

    #[test]
    fn test_unknown_group_is_ignored() {
        let tracker = CongestionTracker::new();
        let (ccg, fq) = ids(0x20);
        tracker.on_congestion_change(ccg, true);
        tracker.on_enqueue_rejected(fq);
        assert!(!tracker.is_congested(ccg));
        assert_eq!(tracker.unmatched_events(), 2);
    }

    #[test]
    fn test_unregister_stops_routing() {
        let tracker = CongestionTracker::new();
        let (ccg, fq) = ids(0x30);
        let state = Arc::new(CongestionState::new());
        tracker.register(ccg, fq, Arc::clone(&state));
        assert!(tracker.unregister(ccg, fq));
        assert!(!tracker.unregister(ccg, fq));

        tracker.on_congestion_change(ccg, true);
        assert!(!state.is_congested());
        assert_eq!(tracker.tracked_leaves(), 0);
    }

    #[test]
    fn test_rejected_frame_moves_to_dropped() {
        let tracker = CongestionTracker::new();
        let (ccg, fq) = ids(0x40);
        let state = Arc::new(CongestionState::new());
        tracker.register(ccg, fq, Arc::clone(&state));
        state.record_enqueue();
        state.record_enqueue();
        tracker.on_enqueue_rejected(fq);
        assert_eq!(
            state.counters(),
            Counters {
                enqueued: 1,
                dropped: 1
            }
        );
    }

    #[test]
    fn test_drain_resets_counters() {
        let state = CongestionState::new();
        state.record_enqueue();
        state.record_drop();
        assert_eq!(
            state.drain(),
            Counters {
                enqueued: 1,
                dropped: 1
            }
        );
        assert_eq!(state.drain(), Counters::default());
    }
}
