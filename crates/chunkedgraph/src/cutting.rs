//! The local mincut behind splits.
//!
//! Operates on the active subgraph a split extracted: supervoxel vertices,
//! affinity weights. Inseparable (infinite-affinity) edges are contracted
//! before the flow runs, so they can never be cut; the returned cut is
//! expressed in original supervoxel pairs.

use crate::edges::Edges;
use crate::error::{ChunkedGraphError, Result};
use crate::id::NodeId;

use chunkedgraph_core::flatgraph::FlatGraph;
use chunkedgraph_core::maxflow::FlowNetwork;
use chunkedgraph_core::{SmallKeyHashMap, SmallKeyHashSet};
use itertools::Itertools;

// Pseudo-terminal vertices; real node ids cannot take these values because
// their layer field is bounded by the layer count.
const SUPER_SOURCE: u64 = u64::MAX;
const SUPER_SINK: u64 = u64::MAX - 1;

/// Computes the minimum source/sink cut of the local graph. Returns the cut
/// as original edge pairs; empty means the terminals were separated by
/// contraction alone (nothing to cut).
pub fn mincut(edges: &Edges, sources: &[NodeId], sinks: &[NodeId]) -> Result<Vec<[NodeId; 2]>> {
    if sources.is_empty() || sinks.is_empty() {
        return Err(ChunkedGraphError::BadRequest(
            "mincut needs at least one source and one sink".into(),
        ));
    }
    if sources.iter().any(|s| sinks.contains(s)) {
        return Err(ChunkedGraphError::BadRequest(
            "sources and sinks overlap".into(),
        ));
    }

    // Contract inseparable edges: each component of the infinite-affinity
    // subgraph collapses onto its minimum id.
    let infinite_pairs: Vec<[u64; 2]> = edges
        .iter()
        .filter(|e| e.affinity.is_infinite())
        .map(|e| [e.node1.0, e.node2.0])
        .collect();
    let mut collapse: SmallKeyHashMap<u64, u64> = SmallKeyHashMap::default();
    let mut expand: SmallKeyHashMap<u64, Vec<u64>> = SmallKeyHashMap::default();
    if !infinite_pairs.is_empty() {
        let fused = FlatGraph::build(&infinite_pairs, &vec![0.0; infinite_pairs.len()]);
        for component in fused.connected_components() {
            let members: Vec<u64> = component.iter().map(|&i| fused.id_of(i)).collect();
            let representative = *members.iter().min().unwrap();
            for &m in &members {
                collapse.insert(m, representative);
            }
            expand.insert(representative, members);
        }
    }
    let collapsed = |id: NodeId| -> u64 { collapse.get(&id.0).copied().unwrap_or(id.0) };

    let remapped_sources: Vec<u64> = sources.iter().map(|&s| collapsed(s)).collect();
    let remapped_sinks: Vec<u64> = sinks.iter().map(|&s| collapsed(s)).collect();
    if remapped_sources
        .iter()
        .any(|s| remapped_sinks.contains(s))
    {
        return Err(ChunkedGraphError::Precondition(
            "sources and sinks are connected by inseparable edges".into(),
        ));
    }

    // The flow graph: finite edges after contraction (self-loops dropped),
    // plus infinite-capacity arcs tying the terminals to their pseudo-vertex.
    let mut flow_pairs: Vec<[u64; 2]> = Vec::new();
    let mut flow_weights: Vec<f32> = Vec::new();
    for e in edges.iter() {
        if e.affinity.is_infinite() {
            continue;
        }
        let (u, v) = (collapsed(e.node1), collapsed(e.node2));
        if u != v {
            flow_pairs.push([u, v]);
            flow_weights.push(e.affinity);
        }
    }
    let finite_edge_count = flow_pairs.len();
    for &s in &remapped_sources {
        flow_pairs.push([SUPER_SOURCE, s]);
        flow_weights.push(f32::INFINITY);
    }
    for &t in &remapped_sinks {
        flow_pairs.push([SUPER_SINK, t]);
        flow_weights.push(f32::INFINITY);
    }

    let graph = FlatGraph::build(&flow_pairs, &flow_weights);
    let source_index = graph.index_of(SUPER_SOURCE).unwrap();
    let sink_index = graph.index_of(SUPER_SINK).unwrap();

    // Components holding neither terminal are dead weight the flow ignores;
    // terminals in different components make the request unanswerable.
    let mut labels = graph.component_labels(&vec![false; graph.edge_count()]);
    if labels[source_index as usize] != labels[sink_index as usize] {
        return Err(ChunkedGraphError::Precondition(
            "sources and sinks are not connected through the local graph".into(),
        ));
    }

    let mut network = FlowNetwork::new(graph.node_count());
    for (i, &[u, v]) in graph.edges().iter().enumerate() {
        network.add_undirected_edge(u, v, graph.weights()[i] as f64);
    }
    let flow = network.max_flow(source_index, sink_index);
    log::debug!(
        "mincut: {} vertices, {} finite edges, flow {}",
        graph.node_count(),
        finite_edge_count,
        flow
    );

    let source_side = network.source_side(source_index);
    let mut cut_indices = Vec::new();
    for (i, &[u, v]) in graph.edges().iter().enumerate().take(finite_edge_count) {
        if source_side[u as usize] != source_side[v as usize] {
            cut_indices.push(i);
        }
    }
    if cut_indices.is_empty() {
        return Ok(Vec::new());
    }

    // The partition itself must respect the terminals.
    let misplaced = remapped_sources
        .iter()
        .any(|&s| !source_side[graph.index_of(s).unwrap() as usize])
        || remapped_sinks
            .iter()
            .any(|&t| source_side[graph.index_of(t).unwrap() as usize]);
    if misplaced {
        return Err(ChunkedGraphError::Precondition(
            "mincut placed a source or sink on the wrong side".into(),
        ));
    }

    // Expand contracted endpoints back to original supervoxel pairs.
    let original_pairs: SmallKeyHashSet<(u64, u64)> = edges
        .iter()
        .map(|e| ordered(e.node1.0, e.node2.0))
        .collect();
    let singleton = |id: u64| vec![id];
    let mut cut = Vec::new();
    for &i in &cut_indices {
        let [u, v] = graph.edges()[i];
        let u_members = expand
            .get(&graph.id_of(u))
            .cloned()
            .unwrap_or_else(|| singleton(graph.id_of(u)));
        let v_members = expand
            .get(&graph.id_of(v))
            .cloned()
            .unwrap_or_else(|| singleton(graph.id_of(v)));
        for (a, b) in u_members.iter().cartesian_product(v_members.iter()) {
            if original_pairs.contains(&ordered(*a, *b)) {
                cut.push([NodeId(*a), NodeId(*b)]);
            }
        }
    }
    cut.sort_unstable();
    cut.dedup();

    // Self-check: removing the cut from the original graph must leave every
    // source disconnected from every sink, sources together, sinks together.
    let all_pairs: Vec<[u64; 2]> = edges.iter().map(|e| [e.node1.0, e.node2.0]).collect();
    let check = FlatGraph::build(&all_pairs, &edges.affinities);
    let cut_set: SmallKeyHashSet<(u64, u64)> =
        cut.iter().map(|&[a, b]| ordered(a.0, b.0)).collect();
    let skip: Vec<bool> = all_pairs
        .iter()
        .map(|&[a, b]| cut_set.contains(&ordered(a, b)))
        .collect();
    labels = check.component_labels(&skip);
    let label_of = |id: NodeId| check.index_of(id.0).map(|i| labels[i as usize]);
    let source_labels: Vec<_> = sources.iter().filter_map(|&s| label_of(s)).collect();
    let sink_labels: Vec<_> = sinks.iter().filter_map(|&t| label_of(t)).collect();
    let separated = source_labels.iter().all_equal()
        && sink_labels.iter().all_equal()
        && source_labels
            .iter()
            .all(|sl| sink_labels.iter().all(|tl| sl != tl));
    if !separated {
        return Err(ChunkedGraphError::Precondition(
            "failed to find a cut that separates the sources from the sinks".into(),
        ));
    }

    Ok(cut)
}

fn ordered(a: u64, b: u64) -> (u64, u64) {
    (a.min(b), a.max(b))
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
