//! The supervoxel edge model.

use crate::id::NodeId;
use crate::meta::ChunkedGraphMeta;

use chunkedgraph_core::SmallKeyHashMap;

/// Affinity of an inseparable edge. These are never cut; the mincut contracts
/// them before computing a flow.
pub const INSEPARABLE_AFFINITY: f32 = f32::INFINITY;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    pub node1: NodeId,
    pub node2: NodeId,
    pub affinity: f32,
    pub area: u64,
}

/// A set of edges in parallel arrays.
#[derive(Clone, Debug, Default)]
pub struct Edges {
    pub node_ids1: Vec<NodeId>,
    pub node_ids2: Vec<NodeId>,
    pub affinities: Vec<f32>,
    pub areas: Vec<u64>,
}

impl Edges {
    pub fn len(&self) -> usize {
        self.node_ids1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids1.is_empty()
    }

    pub fn push(&mut self, edge: Edge) {
        self.node_ids1.push(edge.node1);
        self.node_ids2.push(edge.node2);
        self.affinities.push(edge.affinity);
        self.areas.push(edge.area);
    }

    pub fn get(&self, i: usize) -> Edge {
        Edge {
            node1: self.node_ids1[i],
            node2: self.node_ids2[i],
            affinity: self.affinities[i],
            area: self.areas[i],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Edge> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn pairs(&self) -> Vec<[NodeId; 2]> {
        self.node_ids1
            .iter()
            .zip(self.node_ids2.iter())
            .map(|(&a, &b)| [a, b])
            .collect()
    }

    pub fn extend(&mut self, other: &Edges) {
        self.node_ids1.extend_from_slice(&other.node_ids1);
        self.node_ids2.extend_from_slice(&other.node_ids2);
        self.affinities.extend_from_slice(&other.affinities);
        self.areas.extend_from_slice(&other.areas);
    }
}

impl FromIterator<Edge> for Edges {
    fn from_iter<I: IntoIterator<Item = Edge>>(iter: I) -> Self {
        let mut edges = Edges::default();
        for e in iter {
            edges.push(e);
        }
        edges
    }
}

#[derive(Clone, Debug, Default)]
pub struct CategorizedEdges {
    /// Both endpoints share a parent.
    pub in_edges: Edges,
    /// Endpoints with different parents in the same layer-1 chunk.
    pub out_edges: Edges,
    /// Endpoints with different parents in different layer-1 chunks.
    pub cross_edges: Edges,
}

/// Splits `edges` by the current-parent map instead of testing containment per
/// endpoint. An endpoint with no entry in the map lies outside the set of
/// interest and counts as having a foreign parent.
pub fn categorize_edges(
    meta: &ChunkedGraphMeta,
    edges: &Edges,
    parent_of: &SmallKeyHashMap<NodeId, NodeId>,
) -> CategorizedEdges {
    let mut result = CategorizedEdges::default();
    for edge in edges.iter() {
        let p1 = parent_of.get(&edge.node1);
        let p2 = parent_of.get(&edge.node2);
        let same_parent = matches!((p1, p2), (Some(a), Some(b)) if a == b);
        if same_parent {
            result.in_edges.push(edge);
        } else if meta.cross_chunk_layer(edge.node1, edge.node2) == 1 {
            result.out_edges.push(edge);
        } else {
            result.cross_edges.push(edge);
        }
    }
    result
}

/// Cross-chunk edges of one node, keyed by the layer at which they become
/// relevant. Values are atomic endpoint pairs `[own supervoxel, other]`.
pub type CrossEdgeMap = SmallKeyHashMap<u8, Vec<[NodeId; 2]>>;

/// Merges `other` into `acc` layer by layer.
pub fn merge_cross_edge_maps(acc: &mut CrossEdgeMap, other: &CrossEdgeMap) {
    for (&layer, pairs) in other {
        acc.entry(layer).or_default().extend_from_slice(pairs);
    }
}
