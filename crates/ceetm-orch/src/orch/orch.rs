//! CeetmOrch implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ceetm_qman::{CcgOid, DequeueStats, DomainId, Eligibility, FrameQueueOid};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::types::{
    CeetmOrchConfig, CeetmOrchError, CeetmOrchResult, CeetmOrchStats, Collaborators,
    DeleteOutcome, HierarchyHandle, NodeDump, PolicyTree, PortResolver,
};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::binder::{HardwareBinding, HardwareResourceBinder, LeafSetup, Primitive, QueueBinding};
use crate::congestion::CongestionTracker;
use crate::enqueue::{ClassifyEnqueue, Outcome, Packet, Resolution};
use crate::hierarchy::{
    ChildScheduler, FilterRule, Hierarchy, InnerConfig, Level, NodeConfig, NodeId, NodeState,
    PrioLeafConfig, RootConfig, SchedulerKind, SchedulingNode, TopologyError, WbfsLeafConfig,
};
use crate::rate::RateConverter;
use crate::stats::{Counters, LeafReport, StatsAggregator};

const AUDIT_SOURCE: &str = "CeetmOrch";

/// Egress shaping orchestrator.
///
/// Configuration calls are serialized behind one write lock. The packet path
/// takes the read lock only long enough to resolve its leaf; admission and the
/// hardware submit run after the lock is dropped.
pub struct CeetmOrch {
    config: CeetmOrchConfig,
    state: RwLock<OrchState>,
    tracker: Arc<CongestionTracker>,
    enqueue: ClassifyEnqueue,
    stats_reader: StatsAggregator,
}

impl std::fmt::Debug for CeetmOrch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CeetmOrch")
            .field("config", &self.config)
            .field("hierarchies", &state.hierarchies.len())
            .field("stats", &state.stats)
            .finish()
    }
}

struct OrchState {
    binder: HardwareResourceBinder,
    resolver: Arc<dyn PortResolver>,
    hierarchies: HashMap<HierarchyHandle, Hierarchy>,
    devices: HashMap<String, HierarchyHandle>,
    retired: HashSet<HierarchyHandle>,
    next_handle: u64,
    stats: CeetmOrchStats,
}

fn hierarchy_mut(
    hierarchies: &mut HashMap<HierarchyHandle, Hierarchy>,
    handle: HierarchyHandle,
) -> CeetmOrchResult<&mut Hierarchy> {
    hierarchies
        .get_mut(&handle)
        .ok_or(CeetmOrchError::UnknownHierarchy(handle))
}

fn node_in(
    hierarchy: &Hierarchy,
    handle: HierarchyHandle,
    id: NodeId,
) -> CeetmOrchResult<&SchedulingNode> {
    hierarchy
        .find(id)
        .ok_or(CeetmOrchError::UnknownNode { handle, node: id })
}

fn node_in_mut(
    hierarchy: &mut Hierarchy,
    handle: HierarchyHandle,
    id: NodeId,
) -> CeetmOrchResult<&mut SchedulingNode> {
    hierarchy
        .find_mut(id)
        .ok_or(CeetmOrchError::UnknownNode { handle, node: id })
}

fn major_in_use(hierarchy: &Hierarchy, major: u16) -> bool {
    hierarchy.walk().any(|node| node.id().major() == major)
}

/// Inserts unbound leaves in the `Binding` state. On a refused insert the
/// leaves already added are taken out again.
fn insert_leaves(hierarchy: &mut Hierarchy, nodes: Vec<SchedulingNode>) -> CeetmOrchResult<()> {
    let mut inserted = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        let id = node.id();
        node.state = NodeState::Binding;
        if let Err(reason) = hierarchy.insert(node) {
            remove_nodes(hierarchy, &inserted);
            return Err(CeetmOrchError::topology(id, reason));
        }
        inserted.push(id);
    }
    Ok(())
}

fn remove_nodes(hierarchy: &mut Hierarchy, ids: &[NodeId]) {
    for id in ids.iter().rev() {
        hierarchy.remove(*id);
    }
}

/// Claims the class queues of `plan` on the channel of `channel_node`.
/// All or nothing: on failure the queues claimed so far are released.
fn claim_leaves(
    binder: &mut HardwareResourceBinder,
    hierarchy: &Hierarchy,
    channel_node: NodeId,
    plan: &[(NodeId, u8, LeafSetup)],
) -> CeetmOrchResult<Vec<(NodeId, QueueBinding)>> {
    let channel = hierarchy
        .find(channel_node)
        .and_then(SchedulingNode::binding)
        .and_then(HardwareBinding::as_channel)
        .ok_or_else(|| CeetmOrchError::topology(channel_node, TopologyError::ParentUnbound))?;

    let mut bound = Vec::with_capacity(plan.len());
    for (id, index, setup) in plan {
        match binder.claim_leaf(channel, *index, *setup) {
            Ok(queue) => bound.push((*id, queue)),
            Err(e) => {
                for (_, queue) in bound.into_iter().rev() {
                    binder.release_queue(queue);
                }
                return Err(CeetmOrchError::from_bind(*id, e));
            }
        }
    }
    Ok(bound)
}

impl OrchState {
    fn allocate_handle(&mut self) -> HierarchyHandle {
        self.next_handle += 1;
        HierarchyHandle(self.next_handle)
    }

    fn configure(&mut self, policy: &PolicyTree) -> CeetmOrchResult<HierarchyHandle> {
        let handle = match self.create_root(&policy.device, policy.handle, policy.root_config()) {
            Ok(handle) => handle,
            Err(e) => {
                self.stats.configure_failures += 1;
                return Err(e);
            }
        };
        if let Err(e) = self.populate(handle, policy) {
            warn!(device = %policy.device, %handle, "configure failed, tearing down: {}", e);
            let failures = self.release_hierarchy(handle);
            self.stats.configure_failures += 1;
            audit_log!(AuditRecord::new(AuditCategory::ResourceCreate, AUDIT_SOURCE, "configure")
                .with_object_id(policy.device.clone())
                .with_object_type("hierarchy")
                .with_details(serde_json::json!({ "release_failures": failures }))
                .with_error(e.to_string()));
            return Err(e);
        }
        info!(device = %policy.device, %handle, "hierarchy configured");
        Ok(handle)
    }

    fn populate(&mut self, handle: HierarchyHandle, policy: &PolicyTree) -> CeetmOrchResult<()> {
        for channel in &policy.channels {
            let inner = NodeId::new(policy.handle, channel.minor);
            let config = channel
                .inner_config()
                .map_err(|reason| CeetmOrchError::topology(inner, reason))?;
            self.add_inner(handle, channel.minor, config)?;

            if let Some(prio) = &channel.prio {
                self.attach_prio(handle, inner, prio.handle, &prio.leaves)?;
                for wbfs in &prio.wbfs {
                    let weights = if wbfs.weights.is_empty() {
                        vec![1; wbfs.queues]
                    } else {
                        wbfs.weights.clone()
                    };
                    self.attach_wbfs(
                        handle,
                        NodeId::new(prio.handle, wbfs.parent),
                        wbfs.handle,
                        wbfs.queues,
                        &weights,
                        wbfs.eligibility,
                    )?;
                }
            }
            for rule in &channel.filters {
                self.add_filter(handle, inner, *rule)?;
            }
        }
        for rule in &policy.filters {
            self.add_filter(handle, policy.root_id(), *rule)?;
        }
        Ok(())
    }

    fn create_root(
        &mut self,
        device: &str,
        major: u16,
        config: RootConfig,
    ) -> CeetmOrchResult<HierarchyHandle> {
        let root_id = NodeId::new(major, 0);
        if self.devices.contains_key(device) {
            return Err(CeetmOrchError::DeviceBusy(device.to_string()));
        }
        // a port left held by an earlier teardown may be free by now
        self.retry_stranded();
        let port = self
            .resolver
            .resolve(device)
            .ok_or_else(|| CeetmOrchError::UnknownDevice(device.to_string()))?;

        let mut root = SchedulingNode::new(root_id, None, NodeConfig::Root(config));
        root.state = NodeState::Binding;
        let link = match self.binder.claim_link(port, &config) {
            Ok(link) => link,
            Err(e) => {
                let e = CeetmOrchError::from_bind(root_id, e);
                audit_log!(
                    AuditRecord::new(AuditCategory::ResourceCreate, AUDIT_SOURCE, "create_root")
                        .with_object_id(device)
                        .with_object_type("hierarchy")
                        .with_error(e.to_string())
                );
                return Err(e);
            }
        };
        root.bind(HardwareBinding::Link(link));

        let handle = self.allocate_handle();
        self.hierarchies.insert(handle, Hierarchy::new(device, root));
        self.devices.insert(device.to_string(), handle);
        self.stats.hierarchies_configured += 1;
        self.stats.nodes_bound += 1;

        info!(device, %handle, root = %root_id, domain = %port.domain, link = port.link, "root bound");
        audit_log!(
            AuditRecord::new(AuditCategory::ResourceCreate, AUDIT_SOURCE, "create_root")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(device)
                .with_object_type("hierarchy")
                .with_details(serde_json::json!({
                    "handle": handle.as_raw(),
                    "root": root_id,
                    "shaped": config.shaping_enabled,
                    "rate_bps": config.rate_bps,
                    "ceil_bps": config.ceil_bps,
                }))
        );
        Ok(handle)
    }

    fn add_inner(
        &mut self,
        handle: HierarchyHandle,
        minor: u16,
        config: InnerConfig,
    ) -> CeetmOrchResult<NodeId> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let root_id = hierarchy.root_id();
        let id = NodeId::new(root_id.major(), minor);
        config
            .validate()
            .map_err(|reason| CeetmOrchError::topology(id, reason))?;

        let mut node = SchedulingNode::new(id, Some(root_id), NodeConfig::Inner(config));
        node.state = NodeState::Binding;
        hierarchy
            .insert(node)
            .map_err(|reason| CeetmOrchError::topology(id, reason))?;

        let claimed = match hierarchy
            .root()
            .and_then(SchedulingNode::binding)
            .and_then(HardwareBinding::as_link)
        {
            Some(link) => self
                .binder
                .claim_channel(link, &config)
                .map_err(|e| CeetmOrchError::from_bind(id, e)),
            None => Err(CeetmOrchError::topology(id, TopologyError::ParentUnbound)),
        };
        match claimed {
            Ok(channel) => {
                if let Some(node) = hierarchy.find_mut(id) {
                    node.bind(HardwareBinding::Channel(channel));
                }
                self.stats.nodes_bound += 1;
                debug!(%handle, node = %id, shaped = config.is_shaped(), "inner bound");
                Ok(id)
            }
            Err(e) => {
                remove_nodes(hierarchy, &[id]);
                Err(e)
            }
        }
    }

    fn attach_prio(
        &mut self,
        handle: HierarchyHandle,
        inner: NodeId,
        prio_handle: u16,
        leaves: &[Eligibility],
    ) -> CeetmOrchResult<Vec<NodeId>> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let parent = node_in(hierarchy, handle, inner)?;
        if parent.level() != Level::Inner {
            return Err(CeetmOrchError::topology(inner, TopologyError::InvalidParent));
        }
        if parent.child_scheduler().is_some() {
            return Err(CeetmOrchError::topology(inner, TopologyError::AlreadyBound));
        }
        if leaves.is_empty() || leaves.len() > usize::from(ceetm_qman::PRIO_QUEUES_PER_CHANNEL) {
            return Err(CeetmOrchError::topology(
                inner,
                TopologyError::InvalidQueueCount(leaves.len()),
            ));
        }
        if major_in_use(hierarchy, prio_handle) {
            return Err(CeetmOrchError::topology(
                NodeId::new(prio_handle, 0),
                TopologyError::DuplicateId,
            ));
        }
        if !parent.is_bound() {
            return Err(CeetmOrchError::topology(inner, TopologyError::ParentUnbound));
        }

        let plan: Vec<(NodeId, u8, LeafSetup)> = (0u8..)
            .zip(leaves)
            .map(|(priority, eligibility)| {
                (
                    NodeId::new(prio_handle, u16::from(priority) + 1),
                    priority,
                    LeafSetup::Prio(*eligibility),
                )
            })
            .collect();
        let nodes = (0u8..)
            .zip(leaves)
            .map(|(priority, eligibility)| {
                SchedulingNode::new(
                    NodeId::new(prio_handle, u16::from(priority) + 1),
                    Some(inner),
                    NodeConfig::PrioLeaf(PrioLeafConfig {
                        priority,
                        eligibility: *eligibility,
                    }),
                )
            })
            .collect();
        insert_leaves(hierarchy, nodes)?;

        let ids: Vec<NodeId> = plan.iter().map(|(id, _, _)| *id).collect();
        let bound = match claim_leaves(&mut self.binder, hierarchy, inner, &plan) {
            Ok(bound) => bound,
            Err(e) => {
                remove_nodes(hierarchy, &ids);
                return Err(e);
            }
        };
        self.stats.nodes_bound += bind_leaves(&mut self.binder, hierarchy, bound);
        if let Some(parent) = hierarchy.find_mut(inner) {
            parent.child_scheduler = Some(ChildScheduler {
                handle: prio_handle,
                kind: SchedulerKind::Prio,
            });
        }
        debug!(%handle, %inner, prio = prio_handle, leaves = ids.len(), "prio scheduler attached");
        Ok(ids)
    }

    fn attach_wbfs(
        &mut self,
        handle: HierarchyHandle,
        parent_id: NodeId,
        wbfs_handle: u16,
        queues: usize,
        weights: &[u32],
        eligibility: Eligibility,
    ) -> CeetmOrchResult<Vec<NodeId>> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let parent = node_in(hierarchy, handle, parent_id)?;
        let priority = match parent.config() {
            NodeConfig::PrioLeaf(leaf) => leaf.priority,
            _ => {
                return Err(CeetmOrchError::topology(
                    parent_id,
                    TopologyError::InvalidParent,
                ))
            }
        };
        if priority == 0 {
            return Err(CeetmOrchError::topology(
                parent_id,
                TopologyError::ReservedParent,
            ));
        }
        if parent.child_scheduler().is_some() {
            return Err(CeetmOrchError::topology(parent_id, TopologyError::AlreadyBound));
        }
        if queues != 4 && queues != 8 {
            return Err(CeetmOrchError::topology(
                parent_id,
                TopologyError::InvalidQueueCount(queues),
            ));
        }
        if weights.len() != queues {
            return Err(CeetmOrchError::topology(
                parent_id,
                TopologyError::WeightCountMismatch {
                    expected: queues,
                    actual: weights.len(),
                },
            ));
        }
        let mut codes = Vec::with_capacity(queues);
        for (minor, weight) in (1u16..).zip(weights) {
            let code = RateConverter::to_weight_code(*weight).map_err(|source| {
                CeetmOrchError::from_bind(
                    NodeId::new(wbfs_handle, minor),
                    crate::binder::BindError::Rate {
                        primitive: Primitive::ClassQueue,
                        source,
                    },
                )
            })?;
            codes.push((*weight, code));
        }
        if major_in_use(hierarchy, wbfs_handle) {
            return Err(CeetmOrchError::topology(
                NodeId::new(wbfs_handle, 0),
                TopologyError::DuplicateId,
            ));
        }
        let channel_id = parent
            .parent()
            .ok_or_else(|| CeetmOrchError::topology(parent_id, TopologyError::InvalidParent))?;
        let channel_node = node_in(hierarchy, handle, channel_id)?;
        let (group, slots) = channel_node
            .group_slots()
            .reserve(queues)
            .map_err(|reason| CeetmOrchError::topology(channel_id, reason))?;
        if !channel_node.is_bound() {
            return Err(CeetmOrchError::topology(channel_id, TopologyError::ParentUnbound));
        }

        // group B leaves continue the numbering of group A
        let first_minor: u16 = if group == ceetm_qman::WbfsGroup::B { 5 } else { 1 };
        let plan: Vec<(NodeId, u8, LeafSetup)> = (0u8..)
            .zip(&codes)
            .map(|(offset, (_, code))| {
                (
                    NodeId::new(wbfs_handle, first_minor + u16::from(offset)),
                    group.first_queue() + offset,
                    LeafSetup::Wbfs(*code),
                )
            })
            .collect();
        let nodes = plan
            .iter()
            .zip(&codes)
            .map(|((id, _, _), (weight, code))| {
                SchedulingNode::new(
                    *id,
                    Some(parent_id),
                    NodeConfig::WbfsLeaf(WbfsLeafConfig {
                        weight: *weight,
                        code: *code,
                    }),
                )
            })
            .collect();
        insert_leaves(hierarchy, nodes)?;

        let ids: Vec<NodeId> = plan.iter().map(|(id, _, _)| *id).collect();
        let bound = match claim_leaves(&mut self.binder, hierarchy, channel_id, &plan) {
            Ok(bound) => bound,
            Err(e) => {
                remove_nodes(hierarchy, &ids);
                return Err(e);
            }
        };
        // the group is placed only once all of its queues exist
        let placed = hierarchy
            .find(channel_id)
            .and_then(SchedulingNode::binding)
            .and_then(HardwareBinding::as_channel)
            .map(|channel| {
                self.binder
                    .configure_group(channel, group, priority)
                    .and_then(|_| self.binder.set_group_eligibility(channel, group, eligibility))
            });
        if let Some(Err(e)) = placed {
            for (_, queue) in bound.into_iter().rev() {
                self.binder.release_queue(queue);
            }
            remove_nodes(hierarchy, &ids);
            return Err(CeetmOrchError::from_bind(channel_id, e));
        }

        self.stats.nodes_bound += bind_leaves(&mut self.binder, hierarchy, bound);
        if let Some(channel) = hierarchy.find_mut(channel_id) {
            channel.group_slots = slots;
        }
        if let Some(parent) = hierarchy.find_mut(parent_id) {
            parent.child_scheduler = Some(ChildScheduler {
                handle: wbfs_handle,
                kind: SchedulerKind::Wbfs { group, eligibility },
            });
        }
        debug!(%handle, parent = %parent_id, wbfs = wbfs_handle, %group, "WBFS group attached");
        Ok(ids)
    }

    fn update_root_shaping(
        &mut self,
        handle: HierarchyHandle,
        config: RootConfig,
    ) -> CeetmOrchResult<()> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let root_id = hierarchy.root_id();
        let link = hierarchy
            .root()
            .and_then(SchedulingNode::binding)
            .and_then(HardwareBinding::as_link)
            .ok_or_else(|| CeetmOrchError::topology(root_id, TopologyError::ParentUnbound))?;
        self.binder
            .update_link(link, &config)
            .map_err(|e| CeetmOrchError::from_bind(root_id, e))?;
        if let Some(root) = hierarchy.find_mut(root_id) {
            root.config = NodeConfig::Root(config);
        }
        audit_log!(
            AuditRecord::new(AuditCategory::ResourceModify, AUDIT_SOURCE, "update_root_shaping")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(hierarchy.device())
                .with_object_type("root")
                .with_details(serde_json::json!({
                    "rate_bps": config.rate_bps,
                    "ceil_bps": config.ceil_bps,
                    "overhead": config.overhead,
                }))
        );
        Ok(())
    }

    fn update_inner(
        &mut self,
        handle: HierarchyHandle,
        id: NodeId,
        config: InnerConfig,
    ) -> CeetmOrchResult<()> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let node = node_in(hierarchy, handle, id)?;
        let current = match node.config() {
            NodeConfig::Inner(current) => *current,
            _ => return Err(CeetmOrchError::topology(id, TopologyError::InvalidParent)),
        };
        config
            .validate()
            .map_err(|reason| CeetmOrchError::topology(id, reason))?;
        if current.is_shaped() != config.is_shaped() {
            return Err(CeetmOrchError::topology(id, TopologyError::ShapingModeChange));
        }
        let channel = node
            .binding()
            .and_then(HardwareBinding::as_channel)
            .ok_or_else(|| CeetmOrchError::topology(id, TopologyError::ParentUnbound))?;
        self.binder
            .update_channel(channel, &config)
            .map_err(|e| CeetmOrchError::from_bind(id, e))?;
        if let Some(node) = hierarchy.find_mut(id) {
            node.config = NodeConfig::Inner(config);
        }
        audit_log!(
            AuditRecord::new(AuditCategory::ResourceModify, AUDIT_SOURCE, "update_inner")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(id.to_string())
                .with_object_type("inner")
                .with_details(serde_json::json!({ "config": config }))
        );
        Ok(())
    }

    fn add_filter(
        &mut self,
        handle: HierarchyHandle,
        id: NodeId,
        rule: FilterRule,
    ) -> CeetmOrchResult<()> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let node = node_in_mut(hierarchy, handle, id)?;
        node.filters.insert(rule);
        debug!(%handle, node = %id, pref = rule.pref, class = %rule.class, "filter added");
        Ok(())
    }

    fn remove_filter(
        &mut self,
        handle: HierarchyHandle,
        id: NodeId,
        pref: u32,
    ) -> CeetmOrchResult<bool> {
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        Ok(node_in_mut(hierarchy, handle, id)?.filters.remove(pref))
    }

    fn delete_node(&mut self, handle: HierarchyHandle, id: NodeId) -> CeetmOrchResult<DeleteOutcome> {
        if id == hierarchy_mut(&mut self.hierarchies, handle)?.root_id() {
            self.teardown(handle)?;
            return Ok(DeleteOutcome::TornDown);
        }
        let hierarchy = hierarchy_mut(&mut self.hierarchies, handle)?;
        let level = node_in(hierarchy, handle, id)?.level();
        let blocked = level == Level::Inner && hierarchy.has_bound_descendant(id);
        let node = node_in_mut(hierarchy, handle, id)?;
        node.filters.clear();

        if blocked {
            warn!(%handle, node = %id, "bound nodes below, only filters cleared");
            audit_log!(
                AuditRecord::new(AuditCategory::ResourceDelete, AUDIT_SOURCE, "delete_node")
                    .with_outcome(AuditOutcome::Denied)
                    .with_object_id(id.to_string())
                    .with_object_type(level.to_string())
                    .with_error("bound children keep the binding alive")
            );
            return Ok(DeleteOutcome::FiltersOnly);
        }
        if let Some(binding) = node.unbind() {
            let failures = self.binder.release(binding);
            self.stats.nodes_released += 1;
            self.stats.release_failures += failures as u64;
        }
        self.retry_stranded();
        audit_log!(
            AuditRecord::new(AuditCategory::ResourceDelete, AUDIT_SOURCE, "delete_node")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(id.to_string())
                .with_object_type(level.to_string())
        );
        Ok(DeleteOutcome::LocalRelease)
    }

    fn teardown(&mut self, handle: HierarchyHandle) -> CeetmOrchResult<()> {
        if self.retired.contains(&handle) {
            debug!(%handle, "already torn down");
            return Ok(());
        }
        if !self.hierarchies.contains_key(&handle) {
            return Err(CeetmOrchError::UnknownHierarchy(handle));
        }
        let device = self
            .hierarchies
            .get(&handle)
            .map(|h| h.device().to_string())
            .unwrap_or_default();
        let failures = self.release_hierarchy(handle);
        self.stats.hierarchies_torn_down += 1;
        self.retry_stranded();
        info!(%device, %handle, failures, "hierarchy torn down");
        audit_log!(
            AuditRecord::new(AuditCategory::ResourceDelete, AUDIT_SOURCE, "teardown")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(device)
                .with_object_type("hierarchy")
                .with_details(serde_json::json!({
                    "handle": handle.as_raw(),
                    "release_failures": failures,
                }))
        );
        Ok(())
    }

    /// Gives back primitives earlier releases had to leave held. Returns how
    /// many are still held.
    fn retry_stranded(&mut self) -> usize {
        if self.binder.stranded() == 0 {
            return 0;
        }
        let held = self.binder.retry_stranded();
        debug!(held, "retried incomplete releases");
        held
    }

    /// Releases every binding of a hierarchy, children first, and retires its
    /// handle. Returns the number of primitives that failed to release.
    fn release_hierarchy(&mut self, handle: HierarchyHandle) -> usize {
        let Some(mut hierarchy) = self.hierarchies.remove(&handle) else {
            return 0;
        };
        let mut failures = 0;
        for id in hierarchy.post_order() {
            let Some(node) = hierarchy.find_mut(id) else {
                continue;
            };
            if let Some(binding) = node.unbind() {
                failures += self.binder.release(binding);
                self.stats.nodes_released += 1;
            }
        }
        self.stats.release_failures += failures as u64;
        self.devices.remove(hierarchy.device());
        self.retired.insert(handle);
        failures
    }
}

/// Installs claimed queues on their nodes. Returns how many were bound.
fn bind_leaves(
    binder: &mut HardwareResourceBinder,
    hierarchy: &mut Hierarchy,
    bound: Vec<(NodeId, QueueBinding)>,
) -> u64 {
    let mut count = 0;
    for (id, queue) in bound {
        match hierarchy.find_mut(id) {
            Some(node) => {
                node.bind(HardwareBinding::Queue(queue));
                count += 1;
            }
            None => {
                binder.release_queue(queue);
            }
        }
    }
    count
}

impl CeetmOrch {
    pub fn new(config: CeetmOrchConfig, collaborators: Collaborators) -> Self {
        let tracker = Arc::new(CongestionTracker::new());
        let binder = HardwareResourceBinder::new(
            Arc::clone(&collaborators.qman),
            Arc::clone(&tracker),
            config.binder_settings(),
        );
        Self {
            state: RwLock::new(OrchState {
                binder,
                resolver: collaborators.resolver,
                hierarchies: HashMap::new(),
                devices: HashMap::new(),
                retired: HashSet::new(),
                next_handle: 0,
                stats: CeetmOrchStats::default(),
            }),
            tracker,
            enqueue: ClassifyEnqueue::new(
                collaborators.classifier,
                collaborators.sink,
                collaborators.allocator,
            ),
            stats_reader: StatsAggregator::new(collaborators.qman),
            config,
        }
    }

    pub fn config(&self) -> &CeetmOrchConfig {
        &self.config
    }

    pub fn stats(&self) -> CeetmOrchStats {
        self.state.read().stats.clone()
    }

    pub fn tracker(&self) -> &Arc<CongestionTracker> {
        &self.tracker
    }

    /// Primitives the hardware refused to release so far.
    pub fn stranded_primitives(&self) -> usize {
        self.state.read().binder.stranded()
    }

    /// Retries releasing primitives the hardware refused earlier. Returns how
    /// many are still held.
    pub fn retry_releases(&self) -> usize {
        self.state.write().retry_stranded()
    }

    /// Link indices currently held in `domain`.
    pub fn links_held(&self, domain: DomainId) -> usize {
        self.state.read().binder.pool().outstanding(domain)
    }

    /// Builds and binds the whole hierarchy of one device.
    ///
    /// Either every node ends up bound or nothing is left behind: a failure
    /// at any step tears down what was built before the error is returned.
    pub fn configure(&self, policy: &PolicyTree) -> CeetmOrchResult<HierarchyHandle> {
        self.state.write().configure(policy)
    }

    /// Claims the link of `device` and creates its root node `major:0`.
    pub fn create_root(
        &self,
        device: &str,
        major: u16,
        config: RootConfig,
    ) -> CeetmOrchResult<HierarchyHandle> {
        self.state.write().create_root(device, major, config)
    }

    /// Adds channel `R:minor` under the root and claims its channel and
    /// congestion groups.
    pub fn add_inner(
        &self,
        handle: HierarchyHandle,
        minor: u16,
        config: InnerConfig,
    ) -> CeetmOrchResult<NodeId> {
        self.state.write().add_inner(handle, minor, config)
    }

    /// Attaches a prio scheduler with one leaf per eligibility entry,
    /// `P:1` being the highest priority.
    pub fn attach_prio(
        &self,
        handle: HierarchyHandle,
        inner: NodeId,
        prio_handle: u16,
        leaves: &[Eligibility],
    ) -> CeetmOrchResult<Vec<NodeId>> {
        self.state
            .write()
            .attach_prio(handle, inner, prio_handle, leaves)
    }

    /// Attaches a 4 or 8 queue WBFS group under a prio leaf other than `P:1`.
    pub fn attach_wbfs(
        &self,
        handle: HierarchyHandle,
        parent: NodeId,
        wbfs_handle: u16,
        queues: usize,
        weights: &[u32],
        eligibility: Eligibility,
    ) -> CeetmOrchResult<Vec<NodeId>> {
        self.state
            .write()
            .attach_wbfs(handle, parent, wbfs_handle, queues, weights, eligibility)
    }

    pub fn update_root_shaping(
        &self,
        handle: HierarchyHandle,
        config: RootConfig,
    ) -> CeetmOrchResult<()> {
        self.state.write().update_root_shaping(handle, config)
    }

    /// Changes rate or weight of a channel. It cannot switch between the two.
    pub fn update_inner(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
        config: InnerConfig,
    ) -> CeetmOrchResult<()> {
        self.state.write().update_inner(handle, node, config)
    }

    pub fn add_filter(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
        rule: FilterRule,
    ) -> CeetmOrchResult<()> {
        self.state.write().add_filter(handle, node, rule)
    }

    pub fn remove_filter(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
        pref: u32,
    ) -> CeetmOrchResult<bool> {
        self.state.write().remove_filter(handle, node, pref)
    }

    /// Deletes a node.
    ///
    /// Deleting the root tears down the hierarchy. Any other node gives up
    /// only its own binding and filters; a channel keeps its binding while
    /// bound leaves remain below it.
    pub fn delete_node(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
    ) -> CeetmOrchResult<DeleteOutcome> {
        self.state.write().delete_node(handle, node)
    }

    /// Releases every node of a hierarchy. Repeating it is a no-op.
    pub fn teardown(&self, handle: HierarchyHandle) -> CeetmOrchResult<()> {
        self.state.write().teardown(handle)
    }

    /// Classifies `packet` from `entry` and admits it to the selected leaf.
    pub fn classify_and_enqueue(
        &self,
        handle: HierarchyHandle,
        packet: Packet,
        entry: NodeId,
    ) -> Outcome {
        let target = {
            let state = self.state.read();
            state.hierarchies.get(&handle).and_then(|hierarchy| {
                match self.enqueue.resolve(hierarchy, &packet, entry) {
                    Resolution::Leaf(leaf) => ClassifyEnqueue::target(hierarchy, leaf),
                    Resolution::Miss => None,
                }
            })
        };
        self.enqueue.admit(target.as_ref(), packet)
    }

    pub fn on_congestion_event(&self, ccg: CcgOid, congested: bool) {
        self.tracker.on_congestion_change(ccg, congested);
    }

    pub fn on_enqueue_rejected(&self, fq: FrameQueueOid) {
        self.tracker.on_enqueue_rejected(fq);
    }

    /// Returns and zeroes a leaf's counters.
    pub fn read_stats(&self, handle: HierarchyHandle, node: NodeId) -> CeetmOrchResult<Counters> {
        self.with_node(handle, node, |n| self.stats_reader.read_and_reset(n))
    }

    pub fn peek_stats(&self, handle: HierarchyHandle, node: NodeId) -> CeetmOrchResult<Counters> {
        self.with_node(handle, node, |n| self.stats_reader.peek(n))
    }

    /// Hardware dequeue counters of a leaf's class queue.
    pub fn dequeue_stats(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
    ) -> CeetmOrchResult<DequeueStats> {
        self.with_node(handle, node, |n| self.stats_reader.dequeue_stats(n))?
            .map_err(|source| CeetmOrchError::Hardware {
                primitive: Primitive::ClassQueue,
                node,
                source,
            })
    }

    pub fn leaf_report(&self, handle: HierarchyHandle) -> CeetmOrchResult<Vec<LeafReport>> {
        self.with_hierarchy(handle, |h| self.stats_reader.report(h))
    }

    /// Snapshot of every node, sorted by id.
    pub fn dump(&self, handle: HierarchyHandle) -> CeetmOrchResult<Vec<NodeDump>> {
        self.with_hierarchy(handle, |hierarchy| {
            let mut nodes: Vec<NodeDump> = hierarchy.walk().map(NodeDump::from).collect();
            nodes.sort_by_key(|n| n.id);
            nodes
        })
    }

    pub fn hierarchy_for(&self, device: &str) -> Option<HierarchyHandle> {
        self.state.read().devices.get(device).copied()
    }

    /// Handles of every live hierarchy.
    pub fn handles(&self) -> Vec<HierarchyHandle> {
        let mut handles: Vec<HierarchyHandle> =
            self.state.read().hierarchies.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Runs `f` against a hierarchy under the read lock.
    pub fn with_hierarchy<R>(
        &self,
        handle: HierarchyHandle,
        f: impl FnOnce(&Hierarchy) -> R,
    ) -> CeetmOrchResult<R> {
        let state = self.state.read();
        let hierarchy = state
            .hierarchies
            .get(&handle)
            .ok_or(CeetmOrchError::UnknownHierarchy(handle))?;
        Ok(f(hierarchy))
    }

    fn with_node<R>(
        &self,
        handle: HierarchyHandle,
        node: NodeId,
        f: impl FnOnce(&SchedulingNode) -> R,
    ) -> CeetmOrchResult<R> {
        let state = self.state.read();
        let hierarchy = state
            .hierarchies
            .get(&handle)
            .ok_or(CeetmOrchError::UnknownHierarchy(handle))?;
        Ok(f(node_in(hierarchy, handle, node)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::PortLocation;
    use crate::config::StaticPortMap;
    use crate::orch::types::{ChannelPolicy, PrioPolicy, ShaperPolicy, WbfsPolicy};
    use ceetm_qman::SimQman;
    use pretty_assertions::assert_eq;

    fn port(link: u8) -> PortLocation {
        PortLocation {
            domain: DomainId(0),
            subportal: link,
            link,
            mtu: 1518,
        }
    }

    fn orch() -> (Arc<SimQman>, CeetmOrch) {
        let sim = Arc::new(SimQman::default());
        let ports = StaticPortMap::new()
            .with_port("eth0", port(0))
            .with_port("eth1", port(1));
        let collaborators = Collaborators::new(sim.clone(), Arc::new(ports));
        (sim, CeetmOrch::new(CeetmOrchConfig::default(), collaborators))
    }

    fn policy() -> PolicyTree {
        PolicyTree {
            device: "eth0".to_string(),
            handle: 1,
            shaper: Some(ShaperPolicy {
                rate_bps: 1_000_000_000,
                ceil_bps: 1_000_000_000,
                mpu: 0,
                overhead: 24,
            }),
            filters: vec![FilterRule {
                pref: 1,
                handle: 1,
                class: NodeId::new(1, 1),
            }],
            channels: vec![ChannelPolicy {
                minor: 1,
                rate_bps: None,
                ceil_bps: None,
                weight: Some(1),
                filters: vec![FilterRule {
                    pref: 1,
                    handle: 1,
                    class: NodeId::new(2, 2),
                }],
                prio: Some(PrioPolicy {
                    handle: 2,
                    leaves: vec![Eligibility::default(); 8],
                    wbfs: Vec::new(),
                }),
            }],
        }
    }

    #[test]
    fn test_configure_binds_every_node() {
        let (sim, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();

        let dump = orch.dump(handle).unwrap();
        assert_eq!(dump.len(), 10);
        assert!(dump.iter().all(|n| n.bound && n.state == NodeState::Bound));
        assert_eq!(orch.hierarchy_for("eth0"), Some(handle));
        // sub-portal, LNI, channel, 16 groups, 8 x (cq, lfq, fq)
        assert_eq!(sim.live_objects(), 2 + 1 + 16 + 24);
        assert_eq!(orch.tracker().tracked_leaves(), 8);
        assert_eq!(orch.stats().nodes_bound, 10);
    }

    #[test]
    fn test_classify_and_enqueue_follows_filters() {
        let (sim, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let root = NodeId::new(1, 0);

        let outcome = orch.classify_and_enqueue(handle, Packet::new(vec![0; 64]).with_mark(1), root);
        assert_eq!(outcome, Outcome::Admitted);
        let counters = orch.read_stats(handle, NodeId::new(2, 2)).unwrap();
        assert_eq!(counters, Counters { enqueued: 1, dropped: 0 });

        let miss = orch.classify_and_enqueue(handle, Packet::new(vec![0; 64]).with_mark(7), root);
        assert_eq!(miss, Outcome::Dropped);
        assert_eq!(sim.frame_queues().iter().filter_map(|fq| sim.depth(*fq)).sum::<usize>(), 1);
    }

    #[test]
    fn test_duplicate_device_is_busy() {
        let (_, orch) = orch();
        orch.configure(&policy()).unwrap();
        assert_eq!(
            orch.configure(&policy()),
            Err(CeetmOrchError::DeviceBusy("eth0".to_string()))
        );
        assert_eq!(orch.stats().configure_failures, 1);
    }

    #[test]
    fn test_unknown_device() {
        let (_, orch) = orch();
        let mut p = policy();
        p.device = "eth9".to_string();
        assert_eq!(
            orch.configure(&p),
            Err(CeetmOrchError::UnknownDevice("eth9".to_string()))
        );
    }

    #[test]
    fn test_failed_configure_leaves_nothing_behind() {
        let (sim, orch) = orch();
        let mut p = policy();
        p.channels.push(ChannelPolicy {
            minor: 2,
            rate_bps: None,
            ceil_bps: None,
            weight: None,
            filters: Vec::new(),
            prio: None,
        });
        let err = orch.configure(&p).unwrap_err();
        assert_eq!(err.topology_reason(), Some(TopologyError::MissingRateOrWeight));
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(orch.links_held(DomainId(0)), 0);
        assert_eq!(orch.hierarchy_for("eth0"), None);
        assert_eq!(orch.tracker().tracked_leaves(), 0);
        assert_eq!(orch.stats().configure_failures, 1);

        // the device is usable again
        orch.configure(&policy()).unwrap();
    }

    #[test]
    fn test_wbfs_layout_and_slots() {
        let (_, orch) = orch();
        let mut p = policy();
        if let Some(prio) = p.channels[0].prio.as_mut() {
            prio.wbfs = vec![
                WbfsPolicy {
                    handle: 3,
                    parent: 2,
                    queues: 4,
                    weights: vec![1, 2, 4, 8],
                    eligibility: Eligibility::default(),
                },
                WbfsPolicy {
                    handle: 4,
                    parent: 3,
                    queues: 4,
                    weights: Vec::new(),
                    eligibility: Eligibility { cr: false, er: true },
                },
            ];
        }
        let handle = orch.configure(&p).unwrap();

        let indices: Vec<(NodeId, u8)> = orch
            .with_hierarchy(handle, |h| {
                let mut v: Vec<(NodeId, u8)> = h
                    .walk()
                    .filter(|n| n.level() == Level::WbfsLeaf)
                    .filter_map(|n| {
                        n.binding()
                            .and_then(HardwareBinding::as_queue)
                            .map(|q| (n.id(), q.index))
                    })
                    .collect();
                v.sort();
                v
            })
            .unwrap();
        assert_eq!(
            indices,
            vec![
                (NodeId::new(3, 1), 8),
                (NodeId::new(3, 2), 9),
                (NodeId::new(3, 3), 10),
                (NodeId::new(3, 4), 11),
                (NodeId::new(4, 5), 12),
                (NodeId::new(4, 6), 13),
                (NodeId::new(4, 7), 14),
                (NodeId::new(4, 8), 15),
            ]
        );

        let err = orch
            .attach_wbfs(handle, NodeId::new(2, 4), 5, 4, &[1; 4], Eligibility::default())
            .unwrap_err();
        assert_eq!(err.topology_reason(), Some(TopologyError::NoGroupSlot));
    }

    #[test]
    fn test_wbfs_checks() {
        let (_, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let attach = |parent: NodeId, major: u16, queues: usize, weights: &[u32]| {
            orch.attach_wbfs(handle, parent, major, queues, weights, Eligibility::default())
                .unwrap_err()
        };

        assert_eq!(
            attach(NodeId::new(2, 9), 3, 4, &[1; 4]),
            CeetmOrchError::UnknownNode {
                handle,
                node: NodeId::new(2, 9)
            }
        );
        assert_eq!(
            attach(NodeId::new(1, 1), 3, 4, &[1; 4]).topology_reason(),
            Some(TopologyError::InvalidParent)
        );
        assert_eq!(
            attach(NodeId::new(2, 1), 3, 4, &[1; 4]).topology_reason(),
            Some(TopologyError::ReservedParent)
        );
        assert_eq!(
            attach(NodeId::new(2, 2), 3, 5, &[1; 5]).topology_reason(),
            Some(TopologyError::InvalidQueueCount(5))
        );
        assert_eq!(
            attach(NodeId::new(2, 2), 3, 4, &[1; 3]).topology_reason(),
            Some(TopologyError::WeightCountMismatch {
                expected: 4,
                actual: 3
            })
        );
        assert_eq!(
            attach(NodeId::new(2, 2), 3, 4, &[1, 1, 0, 1]),
            CeetmOrchError::InvalidWeight {
                node: NodeId::new(3, 3),
                weight: 0,
                max: 248
            }
        );
        assert_eq!(
            attach(NodeId::new(2, 2), 2, 4, &[1; 4]).topology_reason(),
            Some(TopologyError::DuplicateId)
        );
    }

    #[test]
    fn test_attach_prio_twice() {
        let (_, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let err = orch
            .attach_prio(handle, NodeId::new(1, 1), 9, &[Eligibility::default()])
            .unwrap_err();
        assert_eq!(err.topology_reason(), Some(TopologyError::AlreadyBound));
    }

    #[test]
    fn test_channel_exhaustion_names_primitive() {
        let sim = Arc::new(SimQman::new(ceetm_qman::SimConfig {
            channels_per_domain: 1,
            ..ceetm_qman::SimConfig::default()
        }));
        let ports = StaticPortMap::new().with_port("eth0", port(0));
        let orch = CeetmOrch::new(
            CeetmOrchConfig::default(),
            Collaborators::new(sim.clone(), Arc::new(ports)),
        );
        let handle = orch
            .create_root("eth0", 1, RootConfig::default())
            .unwrap();
        orch.add_inner(handle, 1, InnerConfig::Weighted { weight: 1 })
            .unwrap();
        let err = orch
            .add_inner(handle, 2, InnerConfig::Weighted { weight: 1 })
            .unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(matches!(
            err,
            CeetmOrchError::ResourceExhausted {
                primitive: Primitive::Channel,
                ..
            }
        ));
        let present = orch.with_hierarchy(handle, |h| h.contains(NodeId::new(1, 2)));
        assert_eq!(present, Ok(false));
    }

    #[test]
    fn test_update_inner_rejects_mode_change() {
        let (_, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let inner = NodeId::new(1, 1);
        orch.update_inner(handle, inner, InnerConfig::Weighted { weight: 5 })
            .unwrap();
        let err = orch
            .update_inner(
                handle,
                inner,
                InnerConfig::Shaped {
                    rate_bps: 1000,
                    ceil_bps: 1000,
                },
            )
            .unwrap_err();
        assert_eq!(err.topology_reason(), Some(TopologyError::ShapingModeChange));
        let dump = orch.dump(handle).unwrap();
        let node = dump.iter().find(|n| n.id == inner).unwrap();
        assert_eq!(node.config, NodeConfig::Inner(InnerConfig::Weighted { weight: 5 }));
    }

    #[test]
    fn test_root_rate_out_of_range() {
        let (_, orch) = orch();
        let err = orch
            .create_root("eth0", 1, RootConfig::shaped(u64::MAX / 2, u64::MAX / 2, 0))
            .unwrap_err();
        assert!(matches!(err, CeetmOrchError::RateOutOfRange { .. }));
        assert_eq!(orch.links_held(DomainId(0)), 0);
    }

    #[test]
    fn test_delete_policy() {
        let (sim, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let inner = NodeId::new(1, 1);

        assert_eq!(orch.delete_node(handle, inner), Ok(DeleteOutcome::FiltersOnly));
        for minor in 1..=8 {
            assert_eq!(
                orch.delete_node(handle, NodeId::new(2, minor)),
                Ok(DeleteOutcome::LocalRelease)
            );
        }
        assert_eq!(orch.delete_node(handle, inner), Ok(DeleteOutcome::LocalRelease));
        // only the link is left
        assert_eq!(sim.live_objects(), 2);

        assert_eq!(
            orch.delete_node(handle, NodeId::new(1, 0)),
            Ok(DeleteOutcome::TornDown)
        );
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(orch.stats().release_failures, 0);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (sim, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        orch.teardown(handle).unwrap();
        orch.teardown(handle).unwrap();
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(orch.stats().hierarchies_torn_down, 1);
        assert_eq!(
            orch.teardown(HierarchyHandle(99)),
            Err(CeetmOrchError::UnknownHierarchy(HierarchyHandle(99)))
        );
        assert!(orch.handles().is_empty());
    }

    #[test]
    fn test_filters_add_and_remove() {
        let (_, orch) = orch();
        let handle = orch.configure(&policy()).unwrap();
        let root = NodeId::new(1, 0);
        let rule = FilterRule {
            pref: 5,
            handle: 9,
            class: NodeId::new(1, 1),
        };
        orch.add_filter(handle, root, rule).unwrap();
        assert_eq!(orch.remove_filter(handle, root, 5), Ok(true));
        assert_eq!(orch.remove_filter(handle, root, 5), Ok(false));
        assert!(matches!(
            orch.add_filter(handle, NodeId::new(7, 7), rule),
            Err(CeetmOrchError::UnknownNode { .. })
        ));
    }
}
