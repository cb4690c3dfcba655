/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use super::{GraphError, TraceEdge, TraceEdgeKey, TraceNode, TraceNodeKey};
use crate::store::AggregateTrace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(usize);

#[derive(Clone, Debug)]
struct NodeSlot {
    node: TraceNode,
    // incident edges, a self loop counts twice
    degree: usize,
}

/// Host graph held in two arenas addressed by stable ids.
///
/// Removal empties a slot and never moves other entries, so ids handed out
/// stay valid until the next regrouping. Regrouping builds a fresh
/// generation from a remap table and replaces the graph in one step; a
/// failure leaves the old generation untouched.
///
/// Every edge endpoint is a node of the same graph. With
/// `remove_disconnected_nodes` set, nodes left without edges by a filter or
/// group operation are removed as well.
#[derive(Clone, Debug)]
pub struct TraceGraph {
    remove_disconnected_nodes: bool,
    nodes: Vec<Option<NodeSlot>>,
    edges: Vec<Option<TraceEdge>>,
    node_index: BTreeMap<TraceNodeKey, NodeId>,
    edge_index: BTreeMap<TraceEdgeKey, EdgeId>,
}

impl TraceGraph {
    pub fn new(remove_disconnected_nodes: bool) -> Self {
        Self {
            remove_disconnected_nodes,
            nodes: vec![],
            edges: vec![],
            node_index: BTreeMap::new(),
            edge_index: BTreeMap::new(),
        }
    }

    pub fn from_traces(remove_disconnected_nodes: bool, rows: &[AggregateTrace]) -> Self {
        let mut graph = Self::new(remove_disconnected_nodes);
        graph.fill_from_traces(rows);
        graph
    }

    /// One node per distinct address, the first DNS name seen wins. Rows
    /// sharing an edge key are summed.
    pub fn fill_from_traces(&mut self, rows: &[AggregateTrace]) {
        for row in rows {
            for (addr, dns) in [(row.src_addr, &row.src_dns), (row.dst_addr, &row.dst_dns)] {
                let key = TraceNodeKey::from(addr);
                if !self.has_node(&key) {
                    self.insert_node(TraceNode::new(addr));
                }
                if let Some(node) = self.node_mut(&key) {
                    if node.dns_name.is_none() {
                        node.dns_name = dns.clone();
                    }
                }
            }
            let key = TraceEdgeKey {
                source: row.src_addr.into(),
                source_port: row.src_port,
                target: row.dst_addr.into(),
                target_port: row.dst_port,
                protocol: row.protocol,
            };
            if let Err(e) = self.insert_edge(TraceEdge::new(key, row.packet_count, row.byte_count)) {
                warn!("trace row skipped: {}", e);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_index.len()
    }

    pub fn total_packets(&self) -> u64 {
        self.edges().map(|e| e.packet_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.edges().map(|e| e.byte_count).sum()
    }

    /// Nodes in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &TraceNode> {
        self.node_index
            .values()
            .filter_map(|id| self.nodes[id.0].as_ref().map(|s| &s.node))
    }

    /// Edges in key order.
    pub fn edges(&self) -> impl Iterator<Item = &TraceEdge> {
        self.edge_index
            .values()
            .filter_map(|id| self.edges[id.0].as_ref())
    }

    // Keys must not be changed through these, use the group operations to
    // move nodes or edges.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut TraceNode> {
        self.nodes.iter_mut().flatten().map(|s| &mut s.node)
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut TraceEdge> {
        self.edges.iter_mut().flatten()
    }

    pub fn node_id(&self, key: &TraceNodeKey) -> Option<NodeId> {
        self.node_index.get(key).copied()
    }

    pub fn edge_id(&self, key: &TraceEdgeKey) -> Option<EdgeId> {
        self.edge_index.get(key).copied()
    }

    pub fn node(&self, key: &TraceNodeKey) -> Option<&TraceNode> {
        self.slot(key).map(|s| &s.node)
    }

    pub fn node_mut(&mut self, key: &TraceNodeKey) -> Option<&mut TraceNode> {
        let id = self.node_id(key)?;
        self.nodes[id.0].as_mut().map(|s| &mut s.node)
    }

    pub fn edge(&self, key: &TraceEdgeKey) -> Option<&TraceEdge> {
        let id = self.edge_id(key)?;
        self.edges[id.0].as_ref()
    }

    pub fn has_node(&self, key: &TraceNodeKey) -> bool {
        self.node_index.contains_key(key)
    }

    pub fn has_edge(&self, key: &TraceEdgeKey) -> bool {
        self.edge_index.contains_key(key)
    }

    pub fn degree(&self, key: &TraceNodeKey) -> Option<usize> {
        self.slot(key).map(|s| s.degree)
    }

    /// Returns false and keeps the present node if the key is taken.
    pub fn add_node(&mut self, node: TraceNode) -> bool {
        self.insert_node(node)
    }

    /// Adds an edge between two present nodes. An edge with the same key
    /// absorbs the counts.
    pub fn add_edge(&mut self, edge: TraceEdge) -> Result<(), GraphError> {
        self.insert_edge(edge)
    }

    pub fn remove_edge(&mut self, key: &TraceEdgeKey) -> Option<TraceEdge> {
        let edge = self.detach_edge(key)?;
        self.sweep_orphans([edge.source, edge.target]);
        Some(edge)
    }

    /// Removes the node together with its edges.
    pub fn remove_node(&mut self, key: &TraceNodeKey) -> Option<TraceNode> {
        let incident: Vec<TraceEdgeKey> = self
            .edges()
            .filter(|e| e.touches(key))
            .map(|e| e.key())
            .collect();
        let mut neighbours = vec![];
        for edge in incident {
            if self.detach_edge(&edge).is_some() {
                neighbours.push(edge.source);
                neighbours.push(edge.target);
            }
        }
        let node = self.detach_node(key);
        self.sweep_orphans(neighbours);
        node
    }

    /// Keeps the edges `keep` accepts.
    pub fn filter_edges<F: FnMut(&TraceEdge) -> bool>(&mut self, mut keep: F) {
        let removed: Vec<TraceEdgeKey> = self
            .edges()
            .filter(|e| !keep(e))
            .map(|e| e.key())
            .collect();
        for key in removed.iter() {
            self.detach_edge(key);
        }
        debug!("{} edges filtered out", removed.len());
        self.sweep_all_orphans();
    }

    /// Keeps the nodes `keep` accepts, edges of removed nodes go with them.
    pub fn filter_nodes<F: FnMut(&TraceNode) -> bool>(&mut self, mut keep: F) {
        let removed: Vec<TraceNodeKey> = self
            .nodes()
            .filter(|n| !keep(n))
            .map(|n| n.key)
            .collect();
        if !removed.is_empty() {
            let edges: Vec<TraceEdgeKey> = self
                .edges()
                .filter(|e| removed.iter().any(|k| e.touches(k)))
                .map(|e| e.key())
                .collect();
            for key in edges.iter() {
                self.detach_edge(key);
            }
            for key in removed.iter() {
                self.detach_node(key);
            }
            debug!(
                "{} nodes and {} edges filtered out",
                removed.len(),
                edges.len()
            );
        }
        self.sweep_all_orphans();
    }

    /// Replaces every group of edges sharing a selector key by the edge
    /// `merge` builds from it. Merged edges must join present nodes.
    pub fn group_edges<K, F, G>(&mut self, mut selector: F, mut merge: G) -> Result<(), GraphError>
    where
        K: Ord,
        F: FnMut(&TraceEdge) -> K,
        G: FnMut(&K, Vec<TraceEdge>) -> TraceEdge,
    {
        let mut groups: BTreeMap<K, Vec<TraceEdge>> = BTreeMap::new();
        for edge in self.edges() {
            groups.entry(selector(edge)).or_default().push(edge.clone());
        }
        let mut next = Self::new(self.remove_disconnected_nodes);
        for node in self.nodes() {
            next.insert_node(node.clone());
        }
        for (key, members) in groups.iter_mut() {
            next.insert_edge(merge(key, std::mem::take(members)))?;
        }
        next.sweep_all_orphans();
        *self = next;
        Ok(())
    }

    /// Merges nodes sharing a selector key into the node `merge` builds from
    /// them; nodes the selector returns `None` for stay as they are.
    ///
    /// Edges of merged nodes are repointed to the new node with both ports
    /// zeroed, edges ending up with the same key are summed. A merged node
    /// replaces an untouched node with the same key.
    pub fn group_nodes<K, F, G>(&mut self, mut selector: F, mut merge: G) -> Result<(), GraphError>
    where
        K: Ord,
        F: FnMut(&TraceNode) -> Option<K>,
        G: FnMut(&K, Vec<TraceNode>) -> TraceNode,
    {
        let mut groups: BTreeMap<K, Vec<TraceNode>> = BTreeMap::new();
        for node in self.nodes() {
            if let Some(key) = selector(node) {
                groups.entry(key).or_default().push(node.clone());
            }
        }
        if groups.is_empty() {
            return Ok(());
        }

        let mut next = Self::new(self.remove_disconnected_nodes);
        let mut remap: HashMap<TraceNodeKey, TraceNodeKey> = HashMap::new();
        for (key, members) in groups.iter_mut() {
            let members = std::mem::take(members);
            let old_keys: Vec<TraceNodeKey> = members.iter().map(|n| n.key).collect();
            let merged = merge(key, members);
            for old in old_keys {
                remap.insert(old, merged.key);
            }
            let merged_key = merged.key;
            if !next.insert_node(merged) {
                debug!("node groups collide on {}", merged_key);
            }
        }
        for node in self.nodes() {
            if !remap.contains_key(&node.key) {
                next.insert_node(node.clone());
            }
        }

        for edge in self.edges() {
            let source = remap.get(&edge.source);
            let target = remap.get(&edge.target);
            if source.is_none() && target.is_none() {
                next.insert_edge(edge.clone())?;
                continue;
            }
            let mut repointed = edge.clone();
            repointed.source = source.copied().unwrap_or(edge.source);
            repointed.target = target.copied().unwrap_or(edge.target);
            repointed.source_port = 0;
            repointed.target_port = 0;
            next.insert_edge(repointed)?;
        }
        next.sweep_all_orphans();
        *self = next;
        Ok(())
    }

    pub fn disconnected_nodes(&self) -> Vec<TraceNodeKey> {
        self.node_index
            .iter()
            .filter(|(_, id)| matches!(&self.nodes[id.0], Some(s) if s.degree == 0))
            .map(|(k, _)| *k)
            .collect()
    }

    fn slot(&self, key: &TraceNodeKey) -> Option<&NodeSlot> {
        let id = self.node_id(key)?;
        self.nodes[id.0].as_ref()
    }

    fn insert_node(&mut self, node: TraceNode) -> bool {
        if self.node_index.contains_key(&node.key) {
            return false;
        }
        let id = NodeId(self.nodes.len());
        self.node_index.insert(node.key, id);
        self.nodes.push(Some(NodeSlot { node, degree: 0 }));
        true
    }

    fn insert_edge(&mut self, edge: TraceEdge) -> Result<(), GraphError> {
        let key = edge.key();
        for node in [key.source, key.target] {
            if !self.node_index.contains_key(&node) {
                return Err(GraphError::MissingNode { edge: key, node });
            }
        }
        if let Some(id) = self.edge_id(&key) {
            if let Some(present) = self.edges[id.0].as_mut() {
                present.absorb(&edge);
            }
            return Ok(());
        }
        let id = EdgeId(self.edges.len());
        self.edge_index.insert(key, id);
        self.edges.push(Some(edge));
        self.adjust_degree(&key, true);
        Ok(())
    }

    fn detach_edge(&mut self, key: &TraceEdgeKey) -> Option<TraceEdge> {
        let id = self.edge_index.remove(key)?;
        let edge = self.edges[id.0].take()?;
        self.adjust_degree(key, false);
        Some(edge)
    }

    fn detach_node(&mut self, key: &TraceNodeKey) -> Option<TraceNode> {
        let id = self.node_index.remove(key)?;
        self.nodes[id.0].take().map(|s| s.node)
    }

    fn adjust_degree(&mut self, key: &TraceEdgeKey, attach: bool) {
        for node in [key.source, key.target] {
            if let Some(id) = self.node_id(&node) {
                if let Some(slot) = self.nodes[id.0].as_mut() {
                    slot.degree = if attach {
                        slot.degree + 1
                    } else {
                        slot.degree.saturating_sub(1)
                    };
                }
            }
        }
    }

    fn sweep_orphans<I: IntoIterator<Item = TraceNodeKey>>(&mut self, candidates: I) {
        if !self.remove_disconnected_nodes {
            return;
        }
        for key in candidates {
            if self.degree(&key) == Some(0) {
                self.detach_node(&key);
            }
        }
    }

    fn sweep_all_orphans(&mut self) {
        if self.remove_disconnected_nodes {
            let orphans = self.disconnected_nodes();
            self.sweep_orphans(orphans);
        }
    }
}
