//! CeetmOrch types: configuration, policy description, errors and snapshots.

use std::fmt;
use std::sync::Arc;

use ceetm_qman::{CongestionThresholds, Eligibility, QmanApi, QmanError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binder::{BindError, BinderSettings, PortLocation, Primitive};
use crate::enqueue::{
    Classifier, DropAllocator, FwMarkClassifier, HardwareSink, PacketAllocator, PacketSink,
};
use crate::hierarchy::{
    ChildScheduler, FilterRule, GroupSlots, InnerConfig, Level, NodeConfig, NodeId, NodeState,
    RootConfig, SchedulingNode, TopologyError,
};
use crate::rate::{RateConverter, RateError};

/// Identifies one configured hierarchy. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HierarchyHandle(pub(crate) u64);

impl HierarchyHandle {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HierarchyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hierarchy#{}", self.0)
    }
}

/// Device naming service.
pub trait PortResolver: Send + Sync {
    /// Returns where `device` sits on the queue manager.
    fn resolve(&self, device: &str) -> Option<PortLocation>;
}

/// Orchestrator errors. Each names the node and, for hardware failures, the
/// primitive involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CeetmOrchError {
    #[error("{node}: no {primitive} available: {source}")]
    ResourceExhausted {
        primitive: Primitive,
        node: NodeId,
        source: QmanError,
    },

    #[error("{node}: {primitive} failed: {source}")]
    Hardware {
        primitive: Primitive,
        node: NodeId,
        source: QmanError,
    },

    #[error("{node}: {reason}")]
    InvalidTopology {
        node: NodeId,
        #[source]
        reason: TopologyError,
    },

    #[error("{node}: rate {rate_bps} bps exceeds the {max_bps} bps maximum")]
    RateOutOfRange {
        node: NodeId,
        rate_bps: u64,
        max_bps: u64,
    },

    #[error("{node}: WBFS weight {weight} outside 1..={max}")]
    InvalidWeight { node: NodeId, weight: u32, max: u32 },

    #[error("unknown {0}")]
    UnknownHierarchy(HierarchyHandle),

    #[error("node {node} not found in {handle}")]
    UnknownNode {
        handle: HierarchyHandle,
        node: NodeId,
    },

    #[error("no port mapping for device {0}")]
    UnknownDevice(String),

    #[error("device {0} already has a hierarchy")]
    DeviceBusy(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CeetmOrchError {
    pub fn topology(node: NodeId, reason: TopologyError) -> Self {
        CeetmOrchError::InvalidTopology { node, reason }
    }

    /// Lifts a binder failure, attributing it to `node`.
    pub fn from_bind(node: NodeId, err: BindError) -> Self {
        match err {
            BindError::Hardware { primitive, source } if source.is_exhausted() => {
                CeetmOrchError::ResourceExhausted {
                    primitive,
                    node,
                    source,
                }
            }
            BindError::Hardware { primitive, source } => CeetmOrchError::Hardware {
                primitive,
                node,
                source,
            },
            BindError::Rate {
                source: RateError::OutOfRange { rate_bps, max_bps },
                ..
            } => CeetmOrchError::RateOutOfRange {
                node,
                rate_bps,
                max_bps,
            },
            BindError::Rate {
                source: RateError::WeightOutOfRange { weight, max },
                ..
            } => CeetmOrchError::InvalidWeight { node, weight, max },
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, CeetmOrchError::ResourceExhausted { .. })
    }

    /// The topology rule that was violated, if any.
    pub fn topology_reason(&self) -> Option<TopologyError> {
        match self {
            CeetmOrchError::InvalidTopology { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type CeetmOrchResult<T> = Result<T, CeetmOrchError>;

fn default_context_a() -> u64 {
    0x1a00_0000_8000_0000
}

fn default_ticks_per_sec() -> u64 {
    1_000_000
}

fn default_links_per_domain() -> u8 {
    8
}

fn default_mtu() -> u16 {
    1518
}

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeetmOrchConfig {
    /// Thresholds programmed on every congestion group.
    #[serde(default)]
    pub congestion: CongestionThresholds,
    /// Context word installed on every egress frame queue.
    #[serde(default = "default_context_a")]
    pub context_a: u64,
    /// Shaper token update rate.
    #[serde(default = "default_ticks_per_sec")]
    pub ticks_per_sec: u64,
    /// Link indices each queue-manager domain offers.
    #[serde(default = "default_links_per_domain")]
    pub links_per_domain: u8,
    /// MTU used for ports that do not give one.
    #[serde(default = "default_mtu")]
    pub default_mtu: u16,
}

impl Default for CeetmOrchConfig {
    fn default() -> Self {
        Self {
            congestion: CongestionThresholds::default(),
            context_a: default_context_a(),
            ticks_per_sec: default_ticks_per_sec(),
            links_per_domain: default_links_per_domain(),
            default_mtu: default_mtu(),
        }
    }
}

impl CeetmOrchConfig {
    pub fn binder_settings(&self) -> BinderSettings {
        BinderSettings {
            thresholds: self.congestion,
            context_a: self.context_a,
            rates: RateConverter::new(self.ticks_per_sec),
            links_per_domain: self.links_per_domain,
        }
    }
}

/// Lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CeetmOrchStats {
    /// Hierarchies whose root was bound.
    pub hierarchies_configured: u64,
    /// Hierarchies released by teardown.
    pub hierarchies_torn_down: u64,
    /// `configure` calls that failed and were unwound.
    pub configure_failures: u64,
    /// Nodes that reached `Bound`.
    pub nodes_bound: u64,
    /// Nodes whose binding was released.
    pub nodes_released: u64,
    /// Primitives left held by teardown or delete. They are retried later
    /// and not counted again.
    pub release_failures: u64,
}

/// What `delete_node` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// The root was deleted and the whole hierarchy released.
    TornDown,
    /// The node's own binding and filters were released.
    LocalRelease,
    /// Only the filters were cleared; bound nodes below keep the binding alive.
    FiltersOnly,
}

/// Serializable snapshot of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDump {
    pub id: NodeId,
    pub level: Level,
    pub parent: Option<NodeId>,
    pub config: NodeConfig,
    pub state: NodeState,
    pub bound: bool,
    pub child_scheduler: Option<ChildScheduler>,
    pub filters: usize,
    pub group_slots: GroupSlots,
}

impl From<&SchedulingNode> for NodeDump {
    fn from(node: &SchedulingNode) -> Self {
        Self {
            id: node.id(),
            level: node.level(),
            parent: node.parent(),
            config: *node.config(),
            state: node.state(),
            bound: node.is_bound(),
            child_scheduler: node.child_scheduler().copied(),
            filters: node.filter_chain().len(),
            group_slots: node.group_slots(),
        }
    }
}

/// Link shaper of a device's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaperPolicy {
    pub rate_bps: u64,
    pub ceil_bps: u64,
    #[serde(default)]
    pub mpu: u32,
    #[serde(default)]
    pub overhead: u32,
}

/// A WBFS group hanging off one prio leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbfsPolicy {
    pub handle: u16,
    /// Minor of the prio leaf the group attaches to.
    pub parent: u16,
    pub queues: usize,
    /// One weight per queue. Empty means all 1.
    #[serde(default)]
    pub weights: Vec<u32>,
    #[serde(flatten)]
    pub eligibility: Eligibility,
}

fn default_prio_leaves() -> Vec<Eligibility> {
    vec![Eligibility::default(); 8]
}

/// The prio scheduler of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioPolicy {
    pub handle: u16,
    /// Eligibility of each leaf, highest priority first.
    #[serde(default = "default_prio_leaves")]
    pub leaves: Vec<Eligibility>,
    #[serde(default)]
    pub wbfs: Vec<WbfsPolicy>,
}

/// One channel under the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub minor: u16,
    #[serde(default)]
    pub rate_bps: Option<u64>,
    /// Defaults to `rate_bps`.
    #[serde(default)]
    pub ceil_bps: Option<u64>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    #[serde(default)]
    pub prio: Option<PrioPolicy>,
}

impl ChannelPolicy {
    /// A rate makes the channel shaped; otherwise the weight is used.
    pub fn inner_config(&self) -> Result<InnerConfig, TopologyError> {
        let config = match (self.rate_bps, self.weight) {
            (Some(rate_bps), _) => InnerConfig::Shaped {
                rate_bps,
                ceil_bps: self.ceil_bps.unwrap_or(rate_bps),
            },
            (None, Some(weight)) => InnerConfig::Weighted { weight },
            (None, None) => return Err(TopologyError::MissingRateOrWeight),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Complete shaping policy of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTree {
    pub device: String,
    /// Major of the root handle.
    pub handle: u16,
    #[serde(default)]
    pub shaper: Option<ShaperPolicy>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    #[serde(default)]
    pub channels: Vec<ChannelPolicy>,
}

impl PolicyTree {
    pub fn root_id(&self) -> NodeId {
        NodeId::new(self.handle, 0)
    }

    pub fn root_config(&self) -> RootConfig {
        match self.shaper {
            Some(shaper) => RootConfig {
                shaping_enabled: true,
                rate_bps: shaper.rate_bps,
                ceil_bps: shaper.ceil_bps,
                mpu: shaper.mpu,
                overhead: shaper.overhead,
            },
            None => RootConfig::default(),
        }
    }
}

/// External services the orchestrator works with.
#[derive(Clone)]
pub struct Collaborators {
    pub qman: Arc<dyn QmanApi>,
    pub resolver: Arc<dyn PortResolver>,
    pub classifier: Arc<dyn Classifier>,
    pub sink: Arc<dyn PacketSink>,
    pub allocator: Arc<dyn PacketAllocator>,
}

impl Collaborators {
    /// Uses mark-based classification, enqueues on the hardware and frees
    /// dropped packets.
    pub fn new(qman: Arc<dyn QmanApi>, resolver: Arc<dyn PortResolver>) -> Self {
        Self {
            sink: Arc::new(HardwareSink::new(Arc::clone(&qman))),
            qman,
            resolver,
            classifier: Arc::new(FwMarkClassifier),
            allocator: Arc::new(DropAllocator::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PacketAllocator>) -> Self {
        self.allocator = allocator;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults_from_empty_yaml() {
        let config: CeetmOrchConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, CeetmOrchConfig::default());
        assert_eq!(config.congestion.enter, 64);
        assert_eq!(config.congestion.exit, 32);
        assert_eq!(config.context_a, 0x1a00000080000000);
    }

    #[test]
    fn test_channel_policy_prefers_rate() {
        let mut channel = ChannelPolicy {
            minor: 1,
            rate_bps: Some(100),
            ceil_bps: None,
            weight: Some(3),
            filters: Vec::new(),
            prio: None,
        };
        assert_eq!(
            channel.inner_config(),
            Ok(InnerConfig::Shaped {
                rate_bps: 100,
                ceil_bps: 100
            })
        );
        channel.rate_bps = None;
        assert_eq!(channel.inner_config(), Ok(InnerConfig::Weighted { weight: 3 }));
        channel.weight = None;
        assert_eq!(
            channel.inner_config(),
            Err(TopologyError::MissingRateOrWeight)
        );
    }

    #[test]
    fn test_wbfs_policy_flattens_eligibility() {
        let policy: WbfsPolicy =
            serde_yaml::from_str("handle: 3\nparent: 2\nqueues: 4\ner: false\n").unwrap();
        assert_eq!(policy.eligibility, Eligibility { cr: true, er: false });
        assert!(policy.weights.is_empty());
    }

    #[test]
    fn test_prio_policy_defaults_to_eight_leaves() {
        let policy: PrioPolicy = serde_json::from_str(r#"{"handle": 2}"#).unwrap();
        assert_eq!(policy.leaves.len(), 8);
    }

    #[test]
    fn test_bind_error_mapping() {
        let node = NodeId::new(1, 1);
        let exhausted = CeetmOrchError::from_bind(
            node,
            BindError::Hardware {
                primitive: Primitive::Channel,
                source: QmanError::not_available("channel", "pool empty"),
            },
        );
        assert!(exhausted.is_resource_exhausted());

        let rate = CeetmOrchError::from_bind(
            node,
            BindError::Rate {
                primitive: Primitive::ChannelShaper,
                source: RateError::OutOfRange {
                    rate_bps: 5,
                    max_bps: 4,
                },
            },
        );
        assert_eq!(
            rate,
            CeetmOrchError::RateOutOfRange {
                node,
                rate_bps: 5,
                max_bps: 4
            }
        );
        assert!(rate.to_string().contains("1:1"));
    }
}
