//! The chunked graph engine: timestamped reads over the node hierarchy.
//!
//! All relationships are lookups in the column store; the engine holds no
//! object graph, only the metadata, the store handle and a clock. Reads are
//! lock-free and accept an "as of" timestamp; writes live in
//! [`crate::edits`] and serialize per root through leases.

use crate::attributes::{self, Attribute};
use crate::config::RuntimeConfig;
use crate::coords;
use crate::edges::{Edge, Edges};
use crate::error::{ChunkedGraphError, Result};
use crate::id::{ChunkId, NodeId};
use crate::meta::ChunkedGraphMeta;
use crate::operation::{self, OperationRecord};
use crate::store::{
    record_from_bytes, record_to_bytes, Cell, ColumnStore, Mutation, RowKey, Timestamp,
    TimestampOracle,
};

use chunkedgraph_core::glam::IVec3;
use chunkedgraph_core::ilattice::prelude::Extent;
use chunkedgraph_core::{SmallKeyHashMap, SmallKeyHashSet};

use std::time::Duration;

/// Materialized adjacency of one supervoxel at some timestamp. The parallel
/// arrays grow append-only; `active` is the parity of the connected toggle
/// log.
#[derive(Clone, Debug, Default)]
pub struct AtomicAdjacency {
    pub partners: Vec<NodeId>,
    pub affinities: Vec<f32>,
    pub areas: Vec<u64>,
    pub active: Vec<bool>,
}

impl AtomicAdjacency {
    pub fn partner_index(&self, partner: NodeId) -> Option<usize> {
        self.partners.iter().position(|&p| p == partner)
    }

    pub fn active_partners(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        self.partners
            .iter()
            .enumerate()
            .filter(|&(i, _)| self.active[i])
            .map(|(i, &p)| (i, p))
    }
}

pub struct ChunkedGraph {
    meta: ChunkedGraphMeta,
    store: ColumnStore,
    clock: TimestampOracle,
    pub(crate) lock_expiry_micros: u64,
    pub(crate) lock_max_tries: u32,
    pub(crate) lock_backoff: Duration,
    pub(crate) read_only: bool,
}

impl ChunkedGraph {
    /// Creates a new graph and writes its metadata row. Fails if the graph
    /// already exists; the meta record is write-once.
    pub fn create(db: &sled::Db, meta: ChunkedGraphMeta, config: &RuntimeConfig) -> Result<Self> {
        let store = ColumnStore::open(db, &meta.graph_name, config.retry_policy())?;
        if store
            .read_latest(RowKey::Meta, Attribute::GraphMeta, u64::MAX)?
            .is_some()
        {
            return Err(ChunkedGraphError::BadRequest(format!(
                "graph {} already exists",
                meta.graph_name
            )));
        }
        let graph = Self::with_parts(meta, store, config);
        graph.store.bulk_mutate(&[Mutation {
            row: RowKey::Meta,
            attribute: Attribute::GraphMeta,
            timestamp: graph.clock.now(),
            value: record_to_bytes(&graph.meta),
        }])?;
        Ok(graph)
    }

    /// Opens an existing graph by reading its metadata row.
    pub fn open(db: &sled::Db, graph_name: &str, config: &RuntimeConfig) -> Result<Self> {
        let store = ColumnStore::open(db, graph_name, config.retry_policy())?;
        let cell = store
            .read_latest(RowKey::Meta, Attribute::GraphMeta, u64::MAX)?
            .ok_or_else(|| {
                ChunkedGraphError::NotFound(format!("graph {} does not exist", graph_name))
            })?;
        let meta: ChunkedGraphMeta = record_from_bytes(&cell.value);
        Ok(Self::with_parts(meta, store, config))
    }

    fn with_parts(meta: ChunkedGraphMeta, store: ColumnStore, config: &RuntimeConfig) -> Self {
        Self {
            meta,
            store,
            clock: TimestampOracle::default(),
            lock_expiry_micros: config.lock_expiry.as_micros() as u64,
            lock_max_tries: config.lock_max_tries,
            lock_backoff: config.lock_backoff,
            read_only: config.read_only,
        }
    }

    pub fn meta(&self) -> &ChunkedGraphMeta {
        &self.meta
    }

    pub(crate) fn store(&self) -> &ColumnStore {
        &self.store
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ID ALLOCATION

    /// Allocates `count` fresh node ids in `chunk` from its atomic counter.
    pub fn create_node_ids(&self, chunk: ChunkId, count: u64) -> Result<Vec<NodeId>> {
        let layer = self.meta.chunk_layer(chunk);
        let coord = self.meta.chunk_coord_of(chunk);
        let high = self.store.increment(RowKey::Id(NodeId(chunk.0)), count)?;
        if high > self.meta.max_segment_at(layer) {
            return Err(ChunkedGraphError::Internal(format!(
                "segment ids exhausted in chunk {:?} at layer {}",
                coord, layer
            )));
        }
        Ok((high + 1 - count..=high)
            .map(|segment| self.meta.pack(layer, coord, segment))
            .collect())
    }

    pub fn create_node_id(&self, chunk: ChunkId) -> Result<NodeId> {
        Ok(self.create_node_ids(chunk, 1)?[0])
    }

    /// Ensures the chunk counter is at least `floor`, so allocations cannot
    /// collide with externally assigned segment ids.
    pub(crate) fn reserve_segment_ids(&self, chunk: ChunkId, floor: u64) -> Result<()> {
        self.store.raise_counter(RowKey::Id(NodeId(chunk.0)), floor)?;
        Ok(())
    }

    // HIERARCHY READS

    /// The parent valid at `at`, or `None` for roots (and ids not yet born).
    pub fn get_parent(&self, id: NodeId, at: Timestamp) -> Result<Option<NodeId>> {
        let cell = self
            .store
            .read_latest(RowKey::Id(id), Attribute::Parent, at)?;
        cell.map(|c| attributes::decode_u64(&c.value).map(NodeId))
            .transpose()
    }

    /// Walks the parent chain to the root valid at `at`.
    pub fn get_root(&self, id: NodeId, at: Timestamp) -> Result<NodeId> {
        let mut current = id;
        for _ in 0..=self.meta.layer_count {
            match self.get_parent(current, at)? {
                Some(parent) => current = parent,
                None => {
                    if self.meta.layer_of(current) == self.meta.top_layer() {
                        return Ok(current);
                    }
                    let ever = self
                        .store
                        .read_cells(RowKey::Id(current), Attribute::Parent, 0, u64::MAX)?;
                    return if ever.is_empty() {
                        Err(ChunkedGraphError::Internal(format!(
                            "node {} has no parent and is not a root",
                            current
                        )))
                    } else {
                        Err(ChunkedGraphError::NotFound(format!(
                            "node {} does not exist at timestamp {}",
                            current, at
                        )))
                    };
                }
            }
        }
        Err(ChunkedGraphError::Internal(format!(
            "parent chain from {} exceeds the layer count",
            id
        )))
    }

    pub fn get_roots(&self, ids: &[NodeId], at: Timestamp) -> Result<Vec<NodeId>> {
        ids.iter().map(|&id| self.get_root(id, at)).collect()
    }

    /// Child list of a node; empty for supervoxels. Children are written once
    /// at node creation and never change.
    pub fn get_children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        if self.meta.layer_of(id) == 1 {
            return Ok(Vec::new());
        }
        let cell = self
            .store
            .read_latest(RowKey::Id(id), Attribute::Children, u64::MAX)?;
        match cell {
            Some(c) => attributes::decode_ids(&c.value),
            None => Err(ChunkedGraphError::NotFound(format!(
                "node {} has no child list",
                id
            ))),
        }
    }

    /// Cross-chunk edges of one node by layer, as atomic endpoint pairs.
    pub fn get_cross_chunk_edges(&self, id: NodeId) -> Result<crate::edges::CrossEdgeMap> {
        let mut map = crate::edges::CrossEdgeMap::default();
        for layer in 2..self.meta.top_layer() {
            let cell = self.store.read_latest(
                RowKey::Id(id),
                Attribute::CrossChunkEdges(layer),
                u64::MAX,
            )?;
            if let Some(c) = cell {
                let pairs = attributes::decode_id_pairs(&c.value)?;
                if !pairs.is_empty() {
                    map.insert(layer, pairs);
                }
            }
        }
        Ok(map)
    }

    /// Descends from `node` collecting the layer-2 nodes whose chunks
    /// intersect `bbox` (every one when `bbox` is `None`). Subtrees whose
    /// chunk misses the box are pruned without reading them.
    pub fn descend_to_layer2(
        &self,
        node: NodeId,
        bbox: Option<&Extent<IVec3>>,
        _at: Timestamp,
    ) -> Result<Vec<NodeId>> {
        let mut frontier = vec![node];
        let mut out = Vec::new();
        while let Some(n) = frontier.pop() {
            match self.meta.layer_of(n) {
                1 => continue,
                2 => out.push(n),
                _ => {
                    for child in self.get_children(n)? {
                        let keep = match bbox {
                            Some(b) => {
                                coords::chunk_intersects(&self.meta, self.meta.chunk_id_of(child), b)
                            }
                            None => true,
                        };
                        if keep {
                            frontier.push(child);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Every supervoxel under `node`, optionally restricted to `bbox`.
    pub fn get_leaves(
        &self,
        node: NodeId,
        bbox: Option<&Extent<IVec3>>,
        at: Timestamp,
    ) -> Result<Vec<NodeId>> {
        if self.meta.layer_of(node) == 1 {
            return Ok(vec![node]);
        }
        let mut leaves = Vec::new();
        for l2 in self.descend_to_layer2(node, bbox, at)? {
            leaves.extend(self.get_children(l2)?);
        }
        Ok(leaves)
    }

    // ADJACENCY

    /// Reads and materializes the adjacency of many supervoxels at `at`.
    pub fn read_atomic_adjacency(
        &self,
        svs: &[NodeId],
        at: Timestamp,
    ) -> Result<SmallKeyHashMap<NodeId, AtomicAdjacency>> {
        let partner_cells = self.store.read_column(svs, Attribute::AtomicPartners, 0, at)?;
        let affinity_cells = self.store.read_column(svs, Attribute::Affinities, 0, at)?;
        let area_cells = self.store.read_column(svs, Attribute::Areas, 0, at)?;
        let connected_cells = self.store.read_column(svs, Attribute::Connected, 0, at)?;

        let mut result = SmallKeyHashMap::default();
        for &sv in svs {
            let Some(partner_history) = partner_cells.get(&sv) else {
                continue;
            };
            let mut adjacency = AtomicAdjacency::default();
            for cell in oldest_first(partner_history) {
                adjacency
                    .partners
                    .extend(attributes::decode_ids(&cell.value)?);
            }
            if let Some(cells) = affinity_cells.get(&sv) {
                for cell in oldest_first(cells) {
                    adjacency
                        .affinities
                        .extend(attributes::decode_f32s(&cell.value)?);
                }
            }
            if let Some(cells) = area_cells.get(&sv) {
                for cell in oldest_first(cells) {
                    adjacency.areas.extend(attributes::decode_u64s(&cell.value)?);
                }
            }
            if adjacency.affinities.len() != adjacency.partners.len()
                || adjacency.areas.len() != adjacency.partners.len()
            {
                return Err(ChunkedGraphError::Internal(format!(
                    "adjacency arrays of {} are out of sync",
                    sv
                )));
            }

            let mut toggle_counts = vec![0u64; adjacency.partners.len()];
            if let Some(cells) = connected_cells.get(&sv) {
                for cell in cells {
                    for index in attributes::decode_u64s(&cell.value)? {
                        let index = index as usize;
                        if index >= toggle_counts.len() {
                            return Err(ChunkedGraphError::Internal(format!(
                                "connected toggle of {} references partner {} of {}",
                                sv,
                                index,
                                toggle_counts.len()
                            )));
                        }
                        toggle_counts[index] += 1;
                    }
                }
            }
            adjacency.active = toggle_counts.iter().map(|&c| c % 2 == 1).collect();
            result.insert(sv, adjacency);
        }
        Ok(result)
    }

    /// Active edges under `root` whose endpoints' chunks intersect `bbox`,
    /// deduplicated by unordered pair.
    pub fn get_subgraph(
        &self,
        root: NodeId,
        bbox: &Extent<IVec3>,
        at: Timestamp,
    ) -> Result<Edges> {
        let svs = self.get_leaves(root, Some(bbox), at)?;
        let sv_set: SmallKeyHashSet<NodeId> = svs.iter().copied().collect();
        let adjacency = self.read_atomic_adjacency(&svs, at)?;

        let mut edges = Edges::default();
        for &sv in &svs {
            let Some(adj) = adjacency.get(&sv) else { continue };
            for (i, partner) in adj.active_partners() {
                // Keep each unordered pair once; drop edges leaving the set.
                if sv.0 < partner.0 && sv_set.contains(&partner) {
                    edges.push(Edge {
                        node1: sv,
                        node2: partner,
                        affinity: adj.affinities[i],
                        area: adj.areas[i],
                    });
                }
            }
        }
        Ok(edges)
    }

    // COORDINATE LOOKUP

    /// Maps voxel points to supervoxels under `parent_id`. The lookup is
    /// chunk-granular: a point matches the supervoxels whose layer-1 chunk
    /// lies within `max_dist_nm` of it. Returns `None` when any point has no
    /// match or an ambiguous one at this distance.
    pub fn get_atomic_ids_from_coords(
        &self,
        points: &[IVec3],
        parent_id: NodeId,
        max_dist_nm: f64,
        at: Timestamp,
    ) -> Result<Option<Vec<NodeId>>> {
        let mut resolved = Vec::with_capacity(points.len());
        for &p in points {
            let near = coords::chunk_coords_near(&self.meta, p, max_dist_nm);
            if near.is_empty() {
                return Ok(None);
            }
            let candidates: Vec<NodeId> = if self.meta.layer_of(parent_id) == 1 {
                let own = self.meta.chunk_coord(parent_id);
                if near.contains(&own) {
                    vec![parent_id]
                } else {
                    Vec::new()
                }
            } else {
                let boxes: Vec<Extent<IVec3>> = near
                    .iter()
                    .map(|&c| coords::chunk_extent(&self.meta, self.meta.chunk_id(1, c)))
                    .collect();
                let mut bbox = boxes[0];
                for b in &boxes[1..] {
                    bbox = Extent::from_min_and_max(
                        bbox.minimum.min(b.minimum),
                        bbox.max().max(b.max()),
                    );
                }
                self.get_leaves(parent_id, Some(&bbox), at)?
                    .into_iter()
                    .filter(|&sv| near.contains(&self.meta.chunk_coord(sv)))
                    .collect()
            };
            match candidates.as_slice() {
                [sv] => resolved.push(*sv),
                _ => return Ok(None),
            }
        }
        Ok(Some(resolved))
    }

    // HISTORY

    /// Every root id that superseded `root` up to `until`, nearest first.
    pub fn get_future_root_ids(&self, root: NodeId, until: Timestamp) -> Result<Vec<NodeId>> {
        self.walk_root_history(root, Attribute::NewRoots, 0, until)
    }

    /// Every root id that `root` superseded, back to `after`, nearest first.
    pub fn get_past_root_ids(&self, root: NodeId, after: Timestamp) -> Result<Vec<NodeId>> {
        self.walk_root_history(root, Attribute::FormerRoots, after, u64::MAX)
    }

    fn walk_root_history(
        &self,
        root: NodeId,
        direction: Attribute,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<NodeId>> {
        let mut visited: SmallKeyHashSet<NodeId> = [root].into_iter().collect();
        let mut frontier = vec![root];
        let mut out = Vec::new();
        while let Some(n) = frontier.pop() {
            let cells = self.store.read_cells(RowKey::Id(n), direction, start, end)?;
            for cell in cells {
                for linked in attributes::decode_ids(&cell.value)? {
                    if visited.insert(linked) {
                        out.push(linked);
                        frontier.push(linked);
                    }
                }
            }
        }
        Ok(out)
    }

    /// The newest descendants of `root` in the history graph; `root` itself
    /// when it has not been superseded.
    pub(crate) fn newest_root_ids(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let mut visited: SmallKeyHashSet<NodeId> = [root].into_iter().collect();
        let mut frontier = vec![root];
        let mut newest = Vec::new();
        while let Some(n) = frontier.pop() {
            let cells = self
                .store
                .read_cells(RowKey::Id(n), Attribute::NewRoots, 0, u64::MAX)?;
            let mut successors = Vec::new();
            for cell in &cells {
                successors.extend(attributes::decode_ids(&cell.value)?);
            }
            if successors.is_empty() {
                newest.push(n);
            } else {
                for s in successors {
                    if visited.insert(s) {
                        frontier.push(s);
                    }
                }
            }
        }
        newest.sort_unstable();
        Ok(newest)
    }

    /// Creation timestamp of a node: the oldest cell of its identity column.
    pub fn get_node_timestamp(&self, id: NodeId) -> Result<Timestamp> {
        let column = if self.meta.layer_of(id) == 1 {
            Attribute::Parent
        } else {
            Attribute::Children
        };
        let cells = self.store.read_cells(RowKey::Id(id), column, 0, u64::MAX)?;
        cells
            .last()
            .map(|c| c.timestamp)
            .ok_or_else(|| ChunkedGraphError::NotFound(format!("node {} was never created", id)))
    }

    pub fn get_node_timestamps(&self, ids: &[NodeId]) -> Result<Vec<Timestamp>> {
        ids.iter().map(|&id| self.get_node_timestamp(id)).collect()
    }

    // EDGE STATUS

    /// For each edge: does it exist in the adjacency at all, and is it active
    /// at `at`.
    pub fn get_edges_status(
        &self,
        pairs: &[[NodeId; 2]],
        at: Timestamp,
    ) -> Result<Vec<(bool, bool)>> {
        let firsts: Vec<NodeId> = {
            let set: SmallKeyHashSet<NodeId> = pairs.iter().map(|p| p[0]).collect();
            set.into_iter().collect()
        };
        let adjacency = self.read_atomic_adjacency(&firsts, at)?;
        Ok(pairs
            .iter()
            .map(|&[a, b]| match adjacency.get(&a) {
                Some(adj) => match adj.partner_index(b) {
                    Some(i) => (true, adj.active[i]),
                    None => (false, false),
                },
                None => (false, false),
            })
            .collect())
    }

    // OPERATION LOG

    pub fn get_operation(&self, operation_id: u64) -> Result<Option<OperationRecord>> {
        operation::read_operation(&self.store, operation_id)
    }

    pub fn get_max_operation_id(&self) -> Result<u64> {
        operation::max_operation_id(&self.store)
    }
}

fn oldest_first(cells: &[Cell]) -> impl Iterator<Item = &Cell> {
    cells.iter().rev()
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
