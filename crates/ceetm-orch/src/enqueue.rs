//! Packet classification and congestion-aware admission.
//!
//! Resolution runs against the hierarchy under the orchestrator's read lock
//! and yields a [`LeafTarget`] that owns everything admission needs, so the
//! lock is released before the congestion check and the hardware submit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ceetm_qman::{FrameQueueOid, QmanApi};
use serde::Serialize;

use crate::congestion::CongestionState;
use crate::hierarchy::{FilterChain, Hierarchy, NodeId};

/// A frame handed to the shaper by the forwarding path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Firewall mark, matched by [`FwMarkClassifier`].
    pub mark: u32,
    pub priority: u32,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Selects a class for a packet from one filter chain.
pub trait Classifier: Send + Sync {
    fn classify(&self, packet: &Packet, chain: &FilterChain) -> Option<NodeId>;
}

/// Matches the packet mark against rule handles, lowest preference first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FwMarkClassifier;

impl Classifier for FwMarkClassifier {
    fn classify(&self, packet: &Packet, chain: &FilterChain) -> Option<NodeId> {
        chain
            .iter()
            .find(|rule| rule.handle == packet.mark)
            .map(|rule| rule.class)
    }
}

/// Where admitted packets go. A refused packet is handed back.
pub trait PacketSink: Send + Sync {
    fn submit(&self, fq: FrameQueueOid, packet: Packet) -> Result<(), Packet>;
}

/// Enqueues straight onto the hardware frame queue.
pub struct HardwareSink {
    qman: Arc<dyn QmanApi>,
}

impl HardwareSink {
    pub fn new(qman: Arc<dyn QmanApi>) -> Self {
        Self { qman }
    }
}

impl PacketSink for HardwareSink {
    fn submit(&self, fq: FrameQueueOid, packet: Packet) -> Result<(), Packet> {
        match self.qman.enqueue(fq, &packet.data) {
            Ok(()) => Ok(()),
            Err(_) => Err(packet),
        }
    }
}

/// Takes back the memory of dropped packets.
pub trait PacketAllocator: Send + Sync {
    fn release(&self, packet: Packet);
}

/// Frees dropped packets and counts them.
#[derive(Debug, Default)]
pub struct DropAllocator {
    released: AtomicU64,
}

impl DropAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl PacketAllocator for DropAllocator {
    fn release(&self, packet: Packet) {
        drop(packet);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Admitted,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Leaf(NodeId),
    Miss,
}

/// Frame queue and counters of a bound leaf.
#[derive(Debug, Clone)]
pub struct QueueTarget {
    pub frame_queue: FrameQueueOid,
    pub state: Arc<CongestionState>,
}

/// A resolved leaf, detached from the hierarchy.
#[derive(Debug, Clone)]
pub struct LeafTarget {
    pub node: NodeId,
    /// `None` for a leaf without hardware.
    pub queue: Option<QueueTarget>,
}

/// The per-packet classify and admit pipeline.
pub struct ClassifyEnqueue {
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn PacketSink>,
    allocator: Arc<dyn PacketAllocator>,
}

impl ClassifyEnqueue {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn PacketSink>,
        allocator: Arc<dyn PacketAllocator>,
    ) -> Self {
        Self {
            classifier,
            sink,
            allocator,
        }
    }

    /// Follows filter chains from `entry` until a leaf is selected.
    ///
    /// A missing or empty chain, a rule-less match, or a class that does not
    /// exist is a miss. The walk is bounded by the hierarchy size, so a chain
    /// that loops back on itself also ends in a miss.
    pub fn resolve(&self, hierarchy: &Hierarchy, packet: &Packet, entry: NodeId) -> Resolution {
        let Some(mut current) = hierarchy.find(entry) else {
            return Resolution::Miss;
        };
        if current.is_leaf() {
            return Resolution::Leaf(current.id());
        }
        for _ in 0..=hierarchy.len() {
            let chain = current.filter_chain();
            if chain.is_empty() {
                return Resolution::Miss;
            }
            let Some(selected) = self.classifier.classify(packet, chain) else {
                return Resolution::Miss;
            };
            let Some(next) = hierarchy.find(selected) else {
                return Resolution::Miss;
            };
            if next.is_leaf() {
                return Resolution::Leaf(next.id());
            }
            current = next;
        }
        Resolution::Miss
    }

    /// Captures what admission needs from a resolved leaf.
    pub fn target(hierarchy: &Hierarchy, leaf: NodeId) -> Option<LeafTarget> {
        let node = hierarchy.find(leaf)?;
        let queue = node
            .binding()
            .and_then(|b| b.as_queue())
            .map(|queue| QueueTarget {
                frame_queue: queue.frame_queue,
                state: Arc::clone(&queue.state),
            });
        Some(LeafTarget { node: leaf, queue })
    }

    /// Admits or drops a packet. Never fails: every refusal ends as `Dropped`
    /// with the packet returned to the allocator.
    pub fn admit(&self, target: Option<&LeafTarget>, packet: Packet) -> Outcome {
        let Some(queue) = target.and_then(|t| t.queue.as_ref()) else {
            self.allocator.release(packet);
            return Outcome::Dropped;
        };
        if queue.state.is_congested() {
            queue.state.record_drop();
            self.allocator.release(packet);
            return Outcome::Dropped;
        }
        match self.sink.submit(queue.frame_queue, packet) {
            Ok(()) => {
                queue.state.record_enqueue();
                Outcome::Admitted
            }
            Err(packet) => {
                queue.state.record_drop();
                self.allocator.release(packet);
                Outcome::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{
        FilterRule, InnerConfig, NodeConfig, PrioLeafConfig, RootConfig, SchedulingNode,
    };
    use crate::stats::Counters;
    use ceetm_qman::Eligibility;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct RecordingSink {
        accept: bool,
        submitted: Mutex<Vec<FrameQueueOid>>,
    }

    impl PacketSink for RecordingSink {
        fn submit(&self, fq: FrameQueueOid, packet: Packet) -> Result<(), Packet> {
            if self.accept {
                self.submitted.lock().push(fq);
                Ok(())
            } else {
                Err(packet)
            }
        }
    }

    fn pipeline(accept: bool) -> (ClassifyEnqueue, Arc<RecordingSink>, Arc<DropAllocator>) {
        let sink = Arc::new(RecordingSink {
            accept,
            submitted: Mutex::new(Vec::new()),
        });
        let allocator = Arc::new(DropAllocator::new());
        let enqueue = ClassifyEnqueue::new(
            Arc::new(FwMarkClassifier),
            sink.clone(),
            allocator.clone(),
        );
        (enqueue, sink, allocator)
    }

    fn rule(pref: u32, handle: u32, class: NodeId) -> FilterRule {
        FilterRule { pref, handle, class }
    }

    /// 1:0 -> 1:1 -> 2:1..2:2, root selects 1:1 on mark 1, 1:1 selects by mark 10/20.
    fn hierarchy() -> Hierarchy {
        let root_id = NodeId::new(1, 0);
        let inner_id = NodeId::new(1, 1);
        let mut root = SchedulingNode::new(root_id, None, NodeConfig::Root(RootConfig::default()));
        root.filters.insert(rule(1, 1, inner_id));
        root.filters.insert(rule(2, 2, NodeId::new(9, 9)));
        root.filters.insert(rule(3, 3, root_id));
        let mut h = Hierarchy::new("eth0", root);

        let mut inner = SchedulingNode::new(
            inner_id,
            Some(root_id),
            NodeConfig::Inner(InnerConfig::Weighted { weight: 1 }),
        );
        inner.filters.insert(rule(1, 10, NodeId::new(2, 1)));
        inner.filters.insert(rule(2, 20, NodeId::new(2, 2)));
        h.insert(inner).unwrap();
        for minor in 1..=2u16 {
            h.insert(SchedulingNode::new(
                NodeId::new(2, minor),
                Some(inner_id),
                NodeConfig::PrioLeaf(PrioLeafConfig {
                    priority: (minor - 1) as u8,
                    eligibility: Eligibility::default(),
                }),
            ))
            .unwrap();
        }
        h
    }

    fn bound_target(node: NodeId) -> LeafTarget {
        LeafTarget {
            node,
            queue: Some(QueueTarget {
                frame_queue: FrameQueueOid::from_raw(0x2000).unwrap(),
                state: Arc::new(CongestionState::new()),
            }),
        }
    }

    #[test]
    fn test_fwmark_first_matching_rule_wins() {
        let chain: FilterChain = vec![
            rule(20, 5, NodeId::new(2, 2)),
            rule(10, 5, NodeId::new(2, 1)),
        ]
        .into_iter()
        .collect();
        let packet = Packet::new(vec![0; 64]).with_mark(5);
        assert_eq!(
            FwMarkClassifier.classify(&packet, &chain),
            Some(NodeId::new(2, 1))
        );
        assert_eq!(FwMarkClassifier.classify(&packet.with_mark(6), &chain), None);
    }

    #[test]
    fn test_resolve_through_inner_chain() {
        let (enqueue, _, _) = pipeline(true);
        let h = hierarchy();
        let root = h.root_id();
        let packet = Packet::new(vec![0; 64]).with_mark(1);
        // root picks the inner node, whose chain then sees the same mark
        assert_eq!(enqueue.resolve(&h, &packet, root), Resolution::Miss);

        let inner = NodeId::new(1, 1);
        let packet = Packet::new(vec![0; 64]).with_mark(20);
        assert_eq!(
            enqueue.resolve(&h, &packet, inner),
            Resolution::Leaf(NodeId::new(2, 2))
        );
    }

    #[test]
    fn test_resolve_misses() {
        let (enqueue, _, _) = pipeline(true);
        let h = hierarchy();
        let root = h.root_id();
        // unknown class
        let packet = Packet::new(vec![]).with_mark(2);
        assert_eq!(enqueue.resolve(&h, &packet, root), Resolution::Miss);
        // self loop is bounded
        let packet = Packet::new(vec![]).with_mark(3);
        assert_eq!(enqueue.resolve(&h, &packet, root), Resolution::Miss);
        // no rule
        let packet = Packet::new(vec![]).with_mark(77);
        assert_eq!(enqueue.resolve(&h, &packet, root), Resolution::Miss);
        // unknown entry
        assert_eq!(
            enqueue.resolve(&h, &packet, NodeId::new(5, 5)),
            Resolution::Miss
        );
    }

    #[test]
    fn test_leaf_entry_resolves_to_itself() {
        let (enqueue, _, _) = pipeline(true);
        let h = hierarchy();
        let leaf = NodeId::new(2, 1);
        assert_eq!(
            enqueue.resolve(&h, &Packet::default(), leaf),
            Resolution::Leaf(leaf)
        );
    }

    #[test]
    fn test_unbound_leaf_target() {
        let h = hierarchy();
        let target = ClassifyEnqueue::target(&h, NodeId::new(2, 1)).unwrap();
        assert!(target.queue.is_none());
        assert!(ClassifyEnqueue::target(&h, NodeId::new(7, 7)).is_none());
    }

    #[test]
    fn test_admit_counts_enqueue() {
        let (enqueue, sink, allocator) = pipeline(true);
        let target = bound_target(NodeId::new(2, 1));
        let outcome = enqueue.admit(Some(&target), Packet::new(vec![1; 100]));
        assert_eq!(outcome, Outcome::Admitted);
        assert_eq!(sink.submitted.lock().len(), 1);
        assert_eq!(allocator.released(), 0);
        let state = &target.queue.as_ref().unwrap().state;
        assert_eq!(
            state.counters(),
            Counters {
                enqueued: 1,
                dropped: 0
            }
        );
    }

    #[test]
    fn test_congested_leaf_drops_without_submit() {
        let (enqueue, sink, allocator) = pipeline(true);
        let target = bound_target(NodeId::new(2, 1));
        let state = Arc::clone(&target.queue.as_ref().unwrap().state);
        state.set_congested(true);
        for payload in [vec![], vec![0xff; 1500]] {
            assert_eq!(
                enqueue.admit(Some(&target), Packet::new(payload)),
                Outcome::Dropped
            );
        }
        assert!(sink.submitted.lock().is_empty());
        assert_eq!(state.counters().dropped, 2);
        assert_eq!(allocator.released(), 2);
    }

    #[test]
    fn test_sink_refusal_is_a_drop() {
        let (enqueue, _, allocator) = pipeline(false);
        let target = bound_target(NodeId::new(2, 1));
        assert_eq!(
            enqueue.admit(Some(&target), Packet::new(vec![0; 10])),
            Outcome::Dropped
        );
        let state = &target.queue.as_ref().unwrap().state;
        assert_eq!(state.counters().dropped, 1);
        assert_eq!(allocator.released(), 1);
    }

    #[test]
    fn test_miss_and_unbound_release_packet() {
        let (enqueue, _, allocator) = pipeline(true);
        assert_eq!(enqueue.admit(None, Packet::default()), Outcome::Dropped);
        let unbound = LeafTarget {
            node: NodeId::new(2, 1),
            queue: None,
        };
        assert_eq!(
            enqueue.admit(Some(&unbound), Packet::default()),
            Outcome::Dropped
        );
        assert_eq!(allocator.released(), 2);
    }
}
