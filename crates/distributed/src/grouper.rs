//! Partition an execution graph by the node that runs each unit.

use std::collections::{BTreeMap, BTreeSet};

use fanout_common::NodeId;
use fanout_planner::{ExecutionGraph, ExecutionUnit};

/// A unit assigned to a node, remembering the group it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedUnit {
    pub group: usize,
    pub unit: ExecutionUnit,
}

/// Node id to assigned units, in graph declaration order per node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOperations {
    by_node: BTreeMap<NodeId, Vec<AssignedUnit>>,
}

impl NodeOperations {
    /// Group every unit of `graph` by the nodes it runs on.
    pub fn group_by_node(graph: &ExecutionGraph) -> Self {
        let mut by_node: BTreeMap<NodeId, Vec<AssignedUnit>> = BTreeMap::new();
        for (group, unit) in graph.units() {
            for node in &unit.nodes {
                by_node.entry(node.clone()).or_default().push(AssignedUnit {
                    group,
                    unit: unit.clone(),
                });
            }
        }
        Self { by_node }
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.by_node.keys()
    }

    pub fn units_for(&self, node: &NodeId) -> &[AssignedUnit] {
        self.by_node.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Move every merge unit into a mapping of its own. Nodes left without
    /// units are dropped from `self`.
    pub fn split_off_merges(&mut self) -> NodeOperations {
        let mut merges = BTreeMap::new();
        for (node, units) in &mut self.by_node {
            let (hosted, rest): (Vec<_>, Vec<_>) = std::mem::take(units)
                .into_iter()
                .partition(|a| a.unit.as_merge().is_some());
            *units = rest;
            if !hosted.is_empty() {
                merges.insert(node.clone(), hosted);
            }
        }
        self.by_node.retain(|_, units| !units.is_empty());
        NodeOperations { by_node: merges }
    }

    /// Take a node's assignment out of the mapping.
    pub fn remove(&mut self, node: &NodeId) -> Option<Vec<AssignedUnit>> {
        self.by_node.remove(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &[AssignedUnit])> {
        self.by_node.iter().map(|(n, u)| (n, u.as_slice()))
    }
}

impl IntoIterator for NodeOperations {
    type Item = (NodeId, Vec<AssignedUnit>);
    type IntoIter = std::collections::btree_map::IntoIter<NodeId, Vec<AssignedUnit>>;

    fn into_iter(self) -> Self::IntoIter {
        self.by_node.into_iter()
    }
}

/// Groups touched by a node's assignment.
pub fn groups_of(units: &[AssignedUnit]) -> BTreeSet<usize> {
    units.iter().map(|a| a.group).collect()
}

/// `(group, producer index)` pairs for which `node` runs the group's
/// final producer, in assignment order.
pub fn final_producer_slots(
    graph: &ExecutionGraph,
    node: &NodeId,
    units: &[AssignedUnit],
) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for assigned in units {
        let group = &graph.groups()[assigned.group];
        let is_final = group
            .final_producer()
            .is_some_and(|fp| fp.id == assigned.unit.id);
        if !is_final {
            continue;
        }
        if let Some(producer) = group.producer_index(node) {
            if !out.contains(&(assigned.group, producer)) {
                out.push((assigned.group, producer));
            }
        }
    }
    out
}
