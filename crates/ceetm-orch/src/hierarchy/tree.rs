//! Node index of one device's scheduling hierarchy.

use std::collections::{hash_map, HashMap};

use super::types::{NodeId, SchedulingNode, TopologyError};

/// All nodes attached to one device, keyed by id.
///
/// Nodes link to each other by id only. Every node except the root has a
/// parent in the index, and every indexed node is reachable from the root.
#[derive(Debug)]
pub struct Hierarchy {
    device: String,
    root: NodeId,
    nodes: HashMap<NodeId, SchedulingNode>,
}

impl Hierarchy {
    pub fn new(device: impl Into<String>, mut root: SchedulingNode) -> Self {
        root.parent = None;
        let id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(id, root);
        Self {
            device: device.into(),
            root: id,
            nodes,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn root(&self) -> Option<&SchedulingNode> {
        self.nodes.get(&self.root)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn find(&self, id: NodeId) -> Option<&SchedulingNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn find_mut(&mut self, id: NodeId) -> Option<&mut SchedulingNode> {
        self.nodes.get_mut(&id)
    }

    /// Adds a node under its parent.
    pub fn insert(&mut self, node: SchedulingNode) -> Result<(), TopologyError> {
        if self.nodes.contains_key(&node.id) {
            return Err(TopologyError::DuplicateId);
        }
        let parent = node
            .parent
            .and_then(|id| self.nodes.get_mut(&id))
            .ok_or(TopologyError::InvalidParent)?;
        parent.children.push(node.id);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// Removes a childless node and unlinks it from its parent.
    ///
    /// Returns `None` when the node is unknown or still has children.
    pub fn remove(&mut self, id: NodeId) -> Option<SchedulingNode> {
        if !self.nodes.get(&id)?.children.is_empty() {
            return None;
        }
        let node = self.nodes.remove(&id)?;
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
        Some(node)
    }

    /// Visits every node once, in no particular order. Call again to restart.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            inner: self.nodes.values(),
        }
    }

    /// Node ids with every child before its parent and later siblings before
    /// earlier ones, which is the order hardware must be released in.
    pub fn post_order(&self) -> Vec<NodeId> {
        self.post_order_from(self.root)
    }

    /// Post-order of the subtree rooted at `id`, `id` included last.
    pub fn post_order_from(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            stack.push((current, true));
            // pushed oldest first so the newest child is emitted first
            stack.extend(node.children.iter().map(|child| (*child, false)));
        }
        order
    }

    /// True if any node below `id` still holds hardware.
    pub fn has_bound_descendant(&self, id: NodeId) -> bool {
        self.post_order_from(id)
            .into_iter()
            .filter(|node| *node != id)
            .any(|node| self.nodes.get(&node).is_some_and(SchedulingNode::is_bound))
    }
}

/// Iterator over the nodes of a [`Hierarchy`].
#[derive(Clone)]
pub struct Walk<'a> {
    inner: hash_map::Values<'a, NodeId, SchedulingNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a SchedulingNode;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{InnerConfig, NodeConfig, PrioLeafConfig, RootConfig};
    use ceetm_qman::Eligibility;
    use pretty_assertions::assert_eq;

    fn root() -> SchedulingNode {
        SchedulingNode::new(
            NodeId::new(1, 0),
            None,
            NodeConfig::Root(RootConfig::default()),
        )
    }

    fn inner(minor: u16) -> SchedulingNode {
        SchedulingNode::new(
            NodeId::new(1, minor),
            Some(NodeId::new(1, 0)),
            NodeConfig::Inner(InnerConfig::Weighted { weight: 1 }),
        )
    }

    fn leaf(major: u16, minor: u16, parent: NodeId) -> SchedulingNode {
        SchedulingNode::new(
            NodeId::new(major, minor),
            Some(parent),
            NodeConfig::PrioLeaf(PrioLeafConfig {
                priority: (minor - 1) as u8,
                eligibility: Eligibility::default(),
            }),
        )
    }

    fn sample() -> Hierarchy {
        let mut h = Hierarchy::new("eth0", root());
        h.insert(inner(1)).unwrap();
        h.insert(inner(2)).unwrap();
        h.insert(leaf(2, 1, NodeId::new(1, 1))).unwrap();
        h.insert(leaf(2, 2, NodeId::new(1, 1))).unwrap();
        h
    }

    #[test]
    fn test_insert_and_find() {
        let h = sample();
        assert_eq!(h.len(), 5);
        assert_eq!(h.device(), "eth0");
        let parent = h.find(NodeId::new(1, 1)).unwrap();
        assert_eq!(parent.children(), &[NodeId::new(2, 1), NodeId::new(2, 2)]);
        assert_eq!(h.find(NodeId::new(2, 2)).unwrap().parent(), Some(NodeId::new(1, 1)));
    }

    #[test]
    fn test_insert_rejects_duplicates_and_orphans() {
        let mut h = sample();
        assert_eq!(h.insert(inner(1)), Err(TopologyError::DuplicateId));
        assert_eq!(
            h.insert(leaf(9, 1, NodeId::new(7, 7))),
            Err(TopologyError::InvalidParent)
        );
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn test_post_order_children_first() {
        let h = sample();
        let order = h.post_order();
        assert_eq!(order.len(), h.len());
        assert_eq!(
            order,
            vec![
                NodeId::new(1, 2),
                NodeId::new(2, 2),
                NodeId::new(2, 1),
                NodeId::new(1, 1),
                NodeId::new(1, 0),
            ]
        );
    }

    #[test]
    fn test_remove_requires_childless() {
        let mut h = sample();
        assert!(h.remove(NodeId::new(1, 1)).is_none());
        assert!(h.remove(NodeId::new(2, 1)).is_some());
        assert_eq!(h.find(NodeId::new(1, 1)).unwrap().children(), &[NodeId::new(2, 2)]);
        assert!(h.remove(NodeId::new(2, 1)).is_none());
    }

    #[test]
    fn test_walk_visits_each_node_once() {
        let h = sample();
        let mut ids: Vec<NodeId> = h.walk().map(SchedulingNode::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        let again = h.walk();
        assert_eq!(again.count(), 5);
    }
}
