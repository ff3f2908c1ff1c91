//! The layer-by-layer hierarchy builder.
//!
//! Layer 1 and 2 of a chunk are written in one atomic step from externally
//! prepared edge collections and the agglomeration component mapping. Layers
//! three and up are built in sequence, each one grouping the chunks below by
//! parent chunk and uniting nodes along their cross-chunk edges.

use crate::attributes::{self, Attribute};
use crate::edges::{
    categorize_edges, merge_cross_edge_maps, CrossEdgeMap, Edge, Edges, INSEPARABLE_AFFINITY,
};
use crate::error::{ChunkedGraphError, Result};
use crate::graph::ChunkedGraph;
use crate::id::{ChunkId, NodeId};
use crate::store::{Mutation, RowKey, Timestamp};

use chunkedgraph_core::glam::IVec3;
use chunkedgraph_core::unionfind::DisjointSets;
use chunkedgraph_core::{SmallKeyHashMap, SmallKeyHashSet};

/// Edge collections of one layer-1 chunk, as delivered by the upstream
/// agglomeration. `node_ids1` of the between- and cross-chunk collections are
/// the supervoxels inside this chunk; the mirrored halves arrive with the
/// neighboring chunks.
#[derive(Clone, Debug, Default)]
pub struct AtomicChunkInput {
    pub in_chunk: Edges,
    pub between_chunk: Edges,
    /// Inseparable edges from supervoxels split across the chunk boundary.
    pub cross_chunk: Edges,
    /// `supervoxel -> component id` for this chunk's supervoxels and the
    /// boundary supervoxels of its neighbors. Supervoxels missing here are
    /// isolated.
    pub component_map: SmallKeyHashMap<NodeId, u64>,
}

impl AtomicChunkInput {
    fn is_active(&self, a: NodeId, b: NodeId) -> bool {
        match (self.component_map.get(&a), self.component_map.get(&b)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        }
    }
}

/// Builds layers 1 and 2 of the chunk at `coord`. Every supervoxel of the
/// chunk gets its adjacency rows, and every component of active in-chunk
/// edges (including isolated supervoxels) becomes one layer-2 node. Returns
/// the new layer-2 ids.
pub fn add_atomic_chunk(
    graph: &ChunkedGraph,
    coord: IVec3,
    input: &AtomicChunkInput,
) -> Result<Vec<NodeId>> {
    let meta = graph.meta();
    let timestamp = graph.now();
    let chunk2 = meta.chunk_id(2, coord);

    // The chunk's supervoxels: every in-chunk endpoint, the near endpoint of
    // every boundary edge, and everything the component map names here.
    let mut sv_set = SmallKeyHashSet::default();
    for edge in input.in_chunk.iter() {
        check_in_chunk(graph, coord, edge.node1)?;
        check_in_chunk(graph, coord, edge.node2)?;
        sv_set.insert(edge.node1);
        sv_set.insert(edge.node2);
    }
    for edge in input.between_chunk.iter().chain(input.cross_chunk.iter()) {
        check_in_chunk(graph, coord, edge.node1)?;
        sv_set.insert(edge.node1);
    }
    for &sv in input.component_map.keys() {
        if meta.chunk_coord(sv) == coord {
            sv_set.insert(sv);
        }
    }
    let mut svs: Vec<NodeId> = sv_set.iter().copied().collect();
    svs.sort_unstable();
    if svs.is_empty() {
        return Ok(Vec::new());
    }

    // Edit-time allocations must not collide with the segment ids the
    // watershed assigned.
    let max_segment = svs.iter().map(|&sv| meta.segment_of(sv)).max().unwrap_or(0);
    graph.reserve_segment_ids(meta.chunk_id(1, coord), max_segment)?;

    // Per-supervoxel adjacency in insertion order.
    #[derive(Default)]
    struct Row {
        partners: Vec<NodeId>,
        affinities: Vec<f32>,
        areas: Vec<u64>,
        active_indices: Vec<u64>,
    }
    let mut rows: SmallKeyHashMap<NodeId, Row> = svs.iter().map(|&sv| (sv, Row::default())).collect();
    let mut add_half_edge = |sv: NodeId, partner: NodeId, affinity: f32, area: u64, active: bool| {
        let row = rows.get_mut(&sv).expect("supervoxel collected above");
        if active {
            row.active_indices.push(row.partners.len() as u64);
        }
        row.partners.push(partner);
        row.affinities.push(affinity);
        row.areas.push(area);
    };
    for edge in input.in_chunk.iter() {
        let active = input.is_active(edge.node1, edge.node2);
        add_half_edge(edge.node1, edge.node2, edge.affinity, edge.area, active);
        add_half_edge(edge.node2, edge.node1, edge.affinity, edge.area, active);
    }
    for edge in input.between_chunk.iter() {
        let active = input.is_active(edge.node1, edge.node2);
        add_half_edge(edge.node1, edge.node2, edge.affinity, edge.area, active);
    }
    for edge in input.cross_chunk.iter() {
        let active = input.is_active(edge.node1, edge.node2);
        add_half_edge(edge.node1, edge.node2, INSEPARABLE_AFFINITY, edge.area, active);
    }

    let mut mutations = Vec::new();
    for &sv in &svs {
        let Some(row) = rows.get(&sv) else { continue };
        let cells = [
            (Attribute::AtomicPartners, attributes::encode_ids(&row.partners)),
            (Attribute::Affinities, attributes::encode_f32s(&row.affinities)),
            (Attribute::Areas, attributes::encode_u64s(&row.areas)),
            (Attribute::Connected, attributes::encode_u64s(&row.active_indices)),
        ];
        for (attribute, value) in cells {
            mutations.push(Mutation {
                row: RowKey::Id(sv),
                attribute,
                timestamp,
                value,
            });
        }
    }

    // Layer 2: one node per component of active in-chunk edges.
    let index_of: SmallKeyHashMap<NodeId, u32> = svs
        .iter()
        .enumerate()
        .map(|(i, &sv)| (sv, i as u32))
        .collect();
    let mut sets = DisjointSets::new(svs.len());
    for edge in input.in_chunk.iter() {
        if input.is_active(edge.node1, edge.node2) {
            if let (Some(&i), Some(&j)) = (index_of.get(&edge.node1), index_of.get(&edge.node2)) {
                sets.union(i, j);
            }
        }
    }

    let components = sets.into_components();
    let l2_ids = graph.create_node_ids(chunk2, components.len() as u64)?;

    // Categorize the active half-edges against the new parents: edges leaving
    // the chunk land in the cross class and get filed under their layer-2
    // node by relevance layer.
    let mut parent_of: SmallKeyHashMap<NodeId, NodeId> = SmallKeyHashMap::default();
    for (component, &l2_id) in components.iter().zip(&l2_ids) {
        for &i in component {
            parent_of.insert(svs[i as usize], l2_id);
        }
    }
    let mut active_edges = Edges::default();
    for &sv in &svs {
        let Some(row) = rows.get(&sv) else { continue };
        for (i, &partner) in row.partners.iter().enumerate() {
            if row.active_indices.contains(&(i as u64)) {
                active_edges.push(Edge {
                    node1: sv,
                    node2: partner,
                    affinity: row.affinities[i],
                    area: row.areas[i],
                });
            }
        }
    }
    let mut cross_by_l2: SmallKeyHashMap<NodeId, CrossEdgeMap> = SmallKeyHashMap::default();
    for edge in categorize_edges(meta, &active_edges, &parent_of).cross_edges.iter() {
        let Some(&l2_id) = parent_of.get(&edge.node1) else { continue };
        let layer = meta.cross_chunk_layer(edge.node1, edge.node2);
        cross_by_l2
            .entry(l2_id)
            .or_default()
            .entry(layer)
            .or_default()
            .push([edge.node1, edge.node2]);
    }

    for (component, &l2_id) in components.iter().zip(&l2_ids) {
        let members: Vec<NodeId> = component.iter().map(|&i| svs[i as usize]).collect();
        let cross_edges = cross_by_l2.remove(&l2_id).unwrap_or_default();
        push_node_mutations(&mut mutations, l2_id, &members, &cross_edges, timestamp);
    }

    graph.store().bulk_mutate(&mutations)?;
    Ok(l2_ids)
}

/// Builds one abstract layer (3 and up) over the chunks at `child_coords`
/// (coordinates on the layer-below grid). Child chunks are grouped by their
/// parent chunk; within each parent, nodes are united along the cross-chunk
/// edges that stay inside it. Returns the new node ids.
pub fn add_layer(graph: &ChunkedGraph, layer: u8, child_coords: &[IVec3]) -> Result<Vec<NodeId>> {
    let meta = graph.meta();
    if layer < 3 || layer > meta.top_layer() {
        return Err(ChunkedGraphError::BadRequest(format!(
            "abstract layers range from 3 to {}, got {}",
            meta.top_layer(),
            layer
        )));
    }
    let timestamp = graph.now();

    let mut parents: SmallKeyHashMap<ChunkId, Vec<IVec3>> = SmallKeyHashMap::default();
    for &c in child_coords {
        let parent = meta.chunk_id(layer, c / meta.fanout as i32);
        let group = parents.entry(parent).or_default();
        if !group.contains(&c) {
            group.push(c);
        }
    }

    let mut created = Vec::new();
    for (parent_chunk, group) in parents {
        let mut candidates = Vec::new();
        for &c in &group {
            collect_parentless(graph, meta.chunk_id(layer - 1, c), &mut candidates)?;
        }
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_unstable();

        let new_nodes = unite_and_write(
            graph,
            parent_chunk,
            layer,
            &candidates,
            timestamp,
        )?;
        created.extend(new_nodes);
    }
    Ok(created)
}

/// Convenience driver: builds every abstract layer over the given layer-1
/// chunk coordinates, bottom up.
pub fn build_hierarchy(graph: &ChunkedGraph, atomic_coords: &[IVec3]) -> Result<()> {
    let meta = graph.meta();
    let fanout = meta.fanout as i32;
    for layer in 3..=meta.top_layer() {
        // Coordinates of the layer below: the layer-2 grid equals the
        // layer-1 grid, so division starts one layer later.
        let divisor = fanout.pow(layer as u32 - 3);
        let mut coords: Vec<IVec3> = atomic_coords.iter().map(|&c| c / divisor).collect();
        coords.sort_unstable_by_key(|c| (c.x, c.y, c.z));
        coords.dedup();
        add_layer(graph, layer, &coords)?;
    }
    Ok(())
}

/// Gathers nodes without parents in `chunk`, descending into child chunks
/// when skip connections may have left promoted nodes below.
fn collect_parentless(
    graph: &ChunkedGraph,
    chunk: ChunkId,
    out: &mut Vec<NodeId>,
) -> Result<()> {
    let meta = graph.meta();
    let (start, end) = meta.chunk_node_range(chunk);
    for (id, _cell) in graph
        .store()
        .read_id_range(start, end, Attribute::Children, u64::MAX)?
    {
        if out.last() == Some(&id) {
            continue; // several Children cells cannot exist, but stay cheap
        }
        if graph.get_parent(id, u64::MAX)?.is_none() {
            out.push(id);
        }
    }
    if meta.use_skip_connections && meta.chunk_layer(chunk) > 2 {
        for child in meta.child_chunks(chunk) {
            if meta.chunk_layer(child) >= 2 {
                collect_parentless(graph, child, out)?;
            }
        }
    }
    Ok(())
}

/// Components of `candidates` under the cross-chunk edges one layer below
/// `layer`, with each component's surviving (layer ≥ `layer`) cross edges
/// aggregated. `cross_of` supplies per-candidate edge maps, which lets the
/// edit engine substitute not-yet-written nodes.
pub(crate) struct UnitedComponents {
    pub members: Vec<Vec<NodeId>>,
    pub cross: Vec<CrossEdgeMap>,
}

pub(crate) fn unite_components(
    candidates: &[NodeId],
    layer: u8,
    cross_of: &mut dyn FnMut(NodeId) -> Result<CrossEdgeMap>,
) -> Result<UnitedComponents> {
    // Cross edges are stored as atomic endpoint pairs [own, other]; the owner
    // map resolves "other" supervoxels back to their candidate.
    let mut cross_maps: Vec<CrossEdgeMap> = Vec::with_capacity(candidates.len());
    let mut owner_of_sv: SmallKeyHashMap<NodeId, u32> = SmallKeyHashMap::default();
    for (i, &candidate) in candidates.iter().enumerate() {
        let map = cross_of(candidate)?;
        if let Some(pairs) = map.get(&(layer - 1)) {
            for pair in pairs {
                owner_of_sv.insert(pair[0], i as u32);
            }
        }
        cross_maps.push(map);
    }

    let mut sets = DisjointSets::new(candidates.len());
    for (i, map) in cross_maps.iter().enumerate() {
        if let Some(pairs) = map.get(&(layer - 1)) {
            for pair in pairs {
                match owner_of_sv.get(&pair[1]) {
                    Some(&j) => {
                        sets.union(i as u32, j);
                    }
                    None => {
                        // Bidirectional storage means the mirrored pair must
                        // have registered the other endpoint.
                        return Err(ChunkedGraphError::Internal(format!(
                            "cross-chunk edge [{}, {}] has no owner for its far side",
                            pair[0], pair[1]
                        )));
                    }
                }
            }
        }
    }

    let mut members = Vec::new();
    let mut cross = Vec::new();
    for component in sets.into_components() {
        let mut cross_edges = CrossEdgeMap::default();
        for &i in &component {
            merge_cross_edge_maps(&mut cross_edges, &cross_maps[i as usize]);
        }
        // Edges below this layer were consumed by the union above.
        cross_edges.retain(|&l, _| l >= layer);
        members.push(component.iter().map(|&i| candidates[i as usize]).collect());
        cross.push(cross_edges);
    }
    Ok(UnitedComponents { members, cross })
}

/// Union-find over `candidates` along their stored cross-chunk edges; writes
/// one new node per surviving component.
fn unite_and_write(
    graph: &ChunkedGraph,
    parent_chunk: ChunkId,
    layer: u8,
    candidates: &[NodeId],
    timestamp: Timestamp,
) -> Result<Vec<NodeId>> {
    let meta = graph.meta();
    let united = unite_components(candidates, layer, &mut |candidate| {
        graph.get_cross_chunk_edges(candidate)
    })?;

    let mut mutations = Vec::new();
    let mut created = Vec::new();
    let top = meta.top_layer();
    for (members, cross_edges) in united.members.iter().zip(&united.cross) {
        // A sole child skips trivial layers and is re-examined above.
        if meta.use_skip_connections && layer < top && members.len() == 1 {
            continue;
        }
        let node_id = graph.create_node_id(parent_chunk)?;
        push_node_mutations(&mut mutations, node_id, members, cross_edges, timestamp);
        created.push(node_id);
    }

    graph.store().bulk_mutate(&mutations)?;
    Ok(created)
}

/// Emits the rows of one new node: its child list and cross edges first, then
/// the parent pointers of its children, so upward walks never dangle.
pub(crate) fn push_node_mutations(
    mutations: &mut Vec<Mutation>,
    node_id: NodeId,
    members: &[NodeId],
    cross_edges: &CrossEdgeMap,
    timestamp: Timestamp,
) {
    mutations.push(Mutation {
        row: RowKey::Id(node_id),
        attribute: Attribute::Children,
        timestamp,
        value: attributes::encode_ids(members),
    });
    for (&layer, pairs) in cross_edges {
        mutations.push(Mutation {
            row: RowKey::Id(node_id),
            attribute: Attribute::CrossChunkEdges(layer),
            timestamp,
            value: attributes::encode_id_pairs(pairs),
        });
    }
    for &member in members {
        mutations.push(Mutation {
            row: RowKey::Id(member),
            attribute: Attribute::Parent,
            timestamp,
            value: attributes::encode_u64(node_id.0),
        });
    }
}

fn check_in_chunk(graph: &ChunkedGraph, coord: IVec3, sv: NodeId) -> Result<()> {
    let meta = graph.meta();
    if meta.layer_of(sv) != 1 || meta.chunk_coord(sv) != coord {
        return Err(ChunkedGraphError::BadRequest(format!(
            "supervoxel {} does not belong to chunk {:?}",
            sv, coord
        )));
    }
    Ok(())
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::meta::{ChunkedGraphMeta, GraphSources};

    fn test_graph(grid_shape: [u32; 3]) -> (sled::Db, ChunkedGraph) {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let meta = ChunkedGraphMeta::new(
            "test",
            [64, 64, 64],
            [4, 4, 40],
            grid_shape,
            2,
            true,
            GraphSources::default(),
        )
        .unwrap();
        let graph = ChunkedGraph::create(&db, meta, &RuntimeConfig::default()).unwrap();
        (db, graph)
    }

    fn sv(graph: &ChunkedGraph, coord: [i32; 3], segment: u64) -> NodeId {
        graph.meta().pack(1, IVec3::from_array(coord), segment)
    }

    fn edge(a: NodeId, b: NodeId, affinity: f32) -> Edge {
        Edge {
            node1: a,
            node2: b,
            affinity,
            area: 1,
        }
    }

    /// Two components and one isolated supervoxel in a single chunk.
    #[test]
    fn atomic_chunk_forms_one_l2_node_per_component() {
        let (_db, graph) = test_graph([1, 1, 1]);
        let s = |seg| sv(&graph, [0, 0, 0], seg);

        let mut input = AtomicChunkInput::default();
        input.in_chunk.push(edge(s(100), s(101), 1.0));
        input.in_chunk.push(edge(s(101), s(102), 0.5));
        input.in_chunk.push(edge(s(200), s(201), 0.9));
        // 102 and 200 touch but belong to different agglomeration components.
        input.in_chunk.push(edge(s(102), s(200), 0.4));
        for (id, component) in [(100, 0), (101, 0), (102, 0), (200, 1), (201, 1)] {
            input.component_map.insert(s(id), component);
        }
        // 300 has no mapping entry: isolated.
        input.in_chunk.push(edge(s(300), s(100), 0.1));

        let l2 = add_atomic_chunk(&graph, IVec3::ZERO, &input).unwrap();
        assert_eq!(l2.len(), 3);

        let now = graph.now();
        assert_eq!(graph.get_root(s(100), now).unwrap(), graph.get_root(s(102), now).unwrap());
        assert_eq!(graph.get_root(s(200), now).unwrap(), graph.get_root(s(201), now).unwrap());
        assert_ne!(graph.get_root(s(100), now).unwrap(), graph.get_root(s(200), now).unwrap());
        // The isolated supervoxel is its own root's only leaf.
        let isolated_root = graph.get_root(s(300), now).unwrap();
        assert_eq!(graph.get_leaves(isolated_root, None, now).unwrap(), vec![s(300)]);

        // The inactive edges exist but are off.
        let status = graph
            .get_edges_status(&[[s(102), s(200)], [s(300), s(100)], [s(100), s(101)]], now)
            .unwrap();
        assert_eq!(status, vec![(true, false), (true, false), (true, true)]);
    }

    /// An active between-chunk edge unites two chunks' components at layer 3.
    #[test]
    fn between_chunk_edges_unite_at_the_cross_layer() {
        let (_db, graph) = test_graph([2, 1, 1]);
        let a = sv(&graph, [0, 0, 0], 1);
        let b = sv(&graph, [1, 0, 0], 1);
        let c = sv(&graph, [1, 0, 0], 2);

        let mut left = AtomicChunkInput::default();
        left.between_chunk.push(edge(a, b, 0.8));
        left.component_map.insert(a, 7);
        left.component_map.insert(b, 7);

        let mut right = AtomicChunkInput::default();
        right.between_chunk.push(edge(b, a, 0.8));
        right.component_map.insert(b, 7);
        right.component_map.insert(a, 7);
        right.component_map.insert(c, 8);

        add_atomic_chunk(&graph, IVec3::ZERO, &left).unwrap();
        add_atomic_chunk(&graph, IVec3::new(1, 0, 0), &right).unwrap();
        build_hierarchy(&graph, &[IVec3::ZERO, IVec3::new(1, 0, 0)]).unwrap();

        let now = graph.now();
        let root_a = graph.get_root(a, now).unwrap();
        assert_eq!(graph.meta().layer_of(root_a), 3);
        assert_eq!(root_a, graph.get_root(b, now).unwrap());
        assert_ne!(root_a, graph.get_root(c, now).unwrap());

        let mut leaves = graph.get_leaves(root_a, None, now).unwrap();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![a, b]);
    }

    /// With skip connections, a singleton component is promoted straight to
    /// the top layer instead of growing a chain of lonely parents.
    #[test]
    fn skip_connections_promote_sole_children() {
        let (_db, graph) = test_graph([4, 1, 1]);
        assert_eq!(graph.meta().top_layer(), 4);
        let a = sv(&graph, [0, 0, 0], 1);

        let mut input = AtomicChunkInput::default();
        input.component_map.insert(a, 0);
        add_atomic_chunk(&graph, IVec3::ZERO, &input).unwrap();
        build_hierarchy(&graph, &[IVec3::ZERO]).unwrap();

        let now = graph.now();
        let l2 = graph.get_parent(a, now).unwrap().unwrap();
        let root = graph.get_parent(l2, now).unwrap().unwrap();
        // Layer 3 was skipped entirely.
        assert_eq!(graph.meta().layer_of(root), 4);
        assert_eq!(graph.get_root(a, now).unwrap(), root);
    }
}
