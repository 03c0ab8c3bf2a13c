//! Scheduling node types.

use std::fmt;
use std::str::FromStr;

use ceetm_qman::{Eligibility, WbfsGroup, WeightCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binder::HardwareBinding;

/// A `major:minor` node handle, printed in hex the way `tc` prints class ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(major: u16, minor: u16) -> Self {
        NodeId(((major as u32) << 16) | minor as u32)
    }

    pub const fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn minor(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major(), self.minor())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node id '{0}', expected <major>:<minor> in hex")]
pub struct ParseNodeIdError(String);

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNodeIdError(s.to_string());
        let (major, minor) = s.split_once(':').ok_or_else(err)?;
        let major = u16::from_str_radix(major.trim(), 16).map_err(|_| err())?;
        let minor = if minor.trim().is_empty() {
            0
        } else {
            u16::from_str_radix(minor.trim(), 16).map_err(|_| err())?
        };
        Ok(NodeId::new(major, minor))
    }
}

impl TryFrom<String> for NodeId {
    type Error = ParseNodeIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Root,
    Inner,
    PrioLeaf,
    WbfsLeaf,
}

impl Level {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Level::PrioLeaf | Level::WbfsLeaf)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Root => write!(f, "root"),
            Level::Inner => write!(f, "inner"),
            Level::PrioLeaf => write!(f, "prio_leaf"),
            Level::WbfsLeaf => write!(f, "wbfs_leaf"),
        }
    }
}

/// Configuration lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unconfigured,
    Binding,
    Bound,
    Released,
}

/// Link shaper settings of a root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub shaping_enabled: bool,
    /// Committed rate.
    #[serde(default)]
    pub rate_bps: u64,
    /// Peak rate.
    #[serde(default)]
    pub ceil_bps: u64,
    /// Minimum packet size.
    #[serde(default)]
    pub mpu: u32,
    /// Per-frame overhead added by the shaper, in bytes.
    #[serde(default)]
    pub overhead: u32,
}

impl RootConfig {
    pub fn shaped(rate_bps: u64, ceil_bps: u64, overhead: u32) -> Self {
        Self {
            shaping_enabled: true,
            rate_bps,
            ceil_bps,
            mpu: 0,
            overhead,
        }
    }
}

/// A channel is either shaped or shares the link by weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerConfig {
    Shaped { rate_bps: u64, ceil_bps: u64 },
    Weighted { weight: u32 },
}

impl InnerConfig {
    pub fn is_shaped(&self) -> bool {
        matches!(self, InnerConfig::Shaped { .. })
    }

    /// A zero rate or zero weight configures nothing.
    pub fn validate(&self) -> Result<(), TopologyError> {
        match self {
            InnerConfig::Shaped { rate_bps: 0, .. } | InnerConfig::Weighted { weight: 0 } => {
                Err(TopologyError::MissingRateOrWeight)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrioLeafConfig {
    /// 0 is the highest priority.
    pub priority: u8,
    pub eligibility: Eligibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbfsLeafConfig {
    pub weight: u32,
    pub code: WeightCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeConfig {
    Root(RootConfig),
    Inner(InnerConfig),
    PrioLeaf(PrioLeafConfig),
    WbfsLeaf(WbfsLeafConfig),
}

impl NodeConfig {
    pub fn level(&self) -> Level {
        match self {
            NodeConfig::Root(_) => Level::Root,
            NodeConfig::Inner(_) => Level::Inner,
            NodeConfig::PrioLeaf(_) => Level::PrioLeaf,
            NodeConfig::WbfsLeaf(_) => Level::WbfsLeaf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SchedulerKind {
    Prio,
    Wbfs {
        group: WbfsGroup,
        eligibility: Eligibility,
    },
}

/// Scheduler nested under a node, identified by its own handle major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChildScheduler {
    pub handle: u16,
    pub kind: SchedulerKind,
}

/// WBFS group occupancy of a channel.
///
/// `TwoGroups` also covers a single 8-queue group, which takes both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSlots {
    #[default]
    None,
    OneGroup,
    TwoGroups,
}

impl GroupSlots {
    /// Picks the group for a new WBFS scheduler of `queues` queues and the
    /// occupancy that results once it is in place.
    pub fn reserve(self, queues: usize) -> Result<(WbfsGroup, GroupSlots), TopologyError> {
        if queues != 4 && queues != 8 {
            return Err(TopologyError::InvalidQueueCount(queues));
        }
        match (self, queues) {
            (GroupSlots::None, 8) => Ok((WbfsGroup::Both, GroupSlots::TwoGroups)),
            (GroupSlots::None, _) => Ok((WbfsGroup::A, GroupSlots::OneGroup)),
            (GroupSlots::OneGroup, 4) => Ok((WbfsGroup::B, GroupSlots::TwoGroups)),
            _ => Err(TopologyError::NoGroupSlot),
        }
    }
}

/// Structural configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("node id already in use")]
    DuplicateId,
    #[error("the priority 0 queue cannot host a WBFS group")]
    ReservedParent,
    #[error("channel has no free WBFS group slot")]
    NoGroupSlot,
    #[error("a scheduler is already attached")]
    AlreadyBound,
    #[error("parent cannot host this kind of node")]
    InvalidParent,
    #[error("parent holds no hardware binding")]
    ParentUnbound,
    #[error("invalid queue count {0}")]
    InvalidQueueCount(usize),
    #[error("expected {expected} weights, got {actual}")]
    WeightCountMismatch { expected: usize, actual: usize },
    #[error("neither rate nor weight configured")]
    MissingRateOrWeight,
    #[error("cannot switch a channel between shaped and weighted")]
    ShapingModeChange,
    #[error("handle major does not belong to this hierarchy")]
    ForeignHandle,
}

/// One classification rule: packets the classifier matches on `handle` go to `class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub pref: u32,
    pub handle: u32,
    pub class: NodeId,
}

/// Filter rules of a node, ordered by preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FilterChain(Vec<FilterRule>);

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a rule, replacing any rule with the same preference.
    pub fn insert(&mut self, rule: FilterRule) {
        match self.0.binary_search_by_key(&rule.pref, |r| r.pref) {
            Ok(pos) => self.0[pos] = rule,
            Err(pos) => self.0.insert(pos, rule),
        }
    }

    pub fn remove(&mut self, pref: u32) -> bool {
        match self.0.binary_search_by_key(&pref, |r| r.pref) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterRule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<FilterRule> for FilterChain {
    fn from_iter<I: IntoIterator<Item = FilterRule>>(iter: I) -> Self {
        let mut chain = FilterChain::new();
        iter.into_iter().for_each(|rule| chain.insert(rule));
        chain
    }
}

/// One node of a scheduling hierarchy.
///
/// Parent and children are ids into the owning [`Hierarchy`](super::Hierarchy).
/// The binding is present exactly while the node holds hardware.
#[derive(Debug)]
pub struct SchedulingNode {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) child_scheduler: Option<ChildScheduler>,
    pub(crate) config: NodeConfig,
    pub(crate) state: NodeState,
    pub(crate) binding: Option<HardwareBinding>,
    pub(crate) filters: FilterChain,
    pub(crate) group_slots: GroupSlots,
}

impl SchedulingNode {
    pub fn new(id: NodeId, parent: Option<NodeId>, config: NodeConfig) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            child_scheduler: None,
            config,
            state: NodeState::Unconfigured,
            binding: None,
            filters: FilterChain::new(),
            group_slots: GroupSlots::None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn level(&self) -> Level {
        self.config.level()
    }

    pub fn is_leaf(&self) -> bool {
        self.level().is_leaf()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn child_scheduler(&self) -> Option<&ChildScheduler> {
        self.child_scheduler.as_ref()
    }

    pub fn binding(&self) -> Option<&HardwareBinding> {
        self.binding.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.filters
    }

    pub fn group_slots(&self) -> GroupSlots {
        self.group_slots
    }

    /// Installs a freshly claimed binding.
    pub(crate) fn bind(&mut self, binding: HardwareBinding) {
        self.binding = Some(binding);
        self.state = NodeState::Bound;
    }

    /// Takes the binding out for release and marks the node released.
    pub(crate) fn unbind(&mut self) -> Option<HardwareBinding> {
        self.state = NodeState::Released;
        self.binding.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_id_format_and_parse() {
        let id = NodeId::new(0x10, 0x2);
        assert_eq!(id.to_string(), "10:2");
        assert_eq!("10:2".parse::<NodeId>().unwrap(), id);
        assert_eq!("1:".parse::<NodeId>().unwrap(), NodeId::new(1, 0));
        assert!("12".parse::<NodeId>().is_err());
        assert!("x:1".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_serde() {
        let rule = FilterRule {
            pref: 1,
            handle: 7,
            class: NodeId::new(2, 3),
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"pref":1,"handle":7,"class":"2:3"}"#);
        let back: FilterRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_group_slot_progression() {
        let (group, slots) = GroupSlots::None.reserve(4).unwrap();
        assert_eq!((group, slots), (WbfsGroup::A, GroupSlots::OneGroup));
        let (group, slots) = slots.reserve(4).unwrap();
        assert_eq!((group, slots), (WbfsGroup::B, GroupSlots::TwoGroups));
        assert_eq!(slots.reserve(4), Err(TopologyError::NoGroupSlot));
    }

    #[test]
    fn test_group_slot_full_group() {
        let (group, slots) = GroupSlots::None.reserve(8).unwrap();
        assert_eq!((group, slots), (WbfsGroup::Both, GroupSlots::TwoGroups));
        assert_eq!(slots.reserve(4), Err(TopologyError::NoGroupSlot));
        assert_eq!(GroupSlots::OneGroup.reserve(8), Err(TopologyError::NoGroupSlot));
        assert_eq!(
            GroupSlots::None.reserve(5),
            Err(TopologyError::InvalidQueueCount(5))
        );
    }

    #[test]
    fn test_filter_chain_ordering() {
        let rule = |pref, handle| FilterRule {
            pref,
            handle,
            class: NodeId::new(1, 1),
        };
        let mut chain: FilterChain = vec![rule(20, 2), rule(10, 1)].into_iter().collect();
        chain.insert(rule(15, 3));
        chain.insert(rule(10, 9));
        let handles: Vec<u32> = chain.iter().map(|r| r.handle).collect();
        assert_eq!(handles, vec![9, 3, 2]);
        assert!(chain.remove(15));
        assert!(!chain.remove(15));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_inner_config_validation() {
        assert!(InnerConfig::Weighted { weight: 1 }.validate().is_ok());
        assert_eq!(
            InnerConfig::Weighted { weight: 0 }.validate(),
            Err(TopologyError::MissingRateOrWeight)
        );
        assert_eq!(
            InnerConfig::Shaped {
                rate_bps: 0,
                ceil_bps: 10
            }
            .validate(),
            Err(TopologyError::MissingRateOrWeight)
        );
    }
}
