//! The edit engine: merge and split under root leases.
//!
//! Both edits follow the same protocol: resolve the inputs, lock every root
//! involved (chasing history to the newest ids), compute all new rows in
//! memory, renew the leases, write everything in one bulk pass ordered
//! children-first with the history linkage and log record last, then unlock.
//! An edit that dies before the final pass leaves only orphan rows behind;
//! the old roots stay authoritative because no new-root linkage was written.

use crate::attributes::{self, Attribute};
use crate::coords;
use crate::cutting;
use crate::edges::{CrossEdgeMap, Edge};
use crate::error::{ChunkedGraphError, Result};
use crate::graph::ChunkedGraph;
use crate::id::NodeId;
use crate::ingest::{push_node_mutations, unite_components};
use crate::operation::{self, OperationKind, OperationRecord};
use crate::store::{lock, Mutation, RowKey, Timestamp};

use chunkedgraph_core::glam::IVec3;
use chunkedgraph_core::unionfind::DisjointSets;
use chunkedgraph_core::{SmallKeyHashMap, SmallKeyHashSet};

/// Distance ladder for resolving click coordinates to supervoxels, in nm.
const LOOKUP_DISTANCES_NM: [f64; 4] = [75.0, 150.0, 250.0, 500.0];

/// Affinity recorded for a merge without an explicit one. Deliberately weak:
/// a later split should prefer undoing the merge over cutting edges the
/// agglomeration believed in.
pub const DEFAULT_MERGE_AFFINITY: f32 = 0.25;

#[derive(Clone, Debug)]
pub struct EditResult {
    pub operation_id: u64,
    pub timestamp: Timestamp,
    pub new_root_ids: Vec<NodeId>,
}

struct RebuildOutcome {
    new_roots: Vec<NodeId>,
    old_roots: Vec<NodeId>,
    mutations: Vec<Mutation>,
}

impl ChunkedGraph {
    /// Merge: activates (or creates) the atomic edge between two supervoxels
    /// and rebuilds the smallest affected subtree into one new root.
    pub fn add_edge(
        &self,
        edge: [NodeId; 2],
        source_coord: IVec3,
        sink_coord: IVec3,
        user: &str,
        affinity: Option<f32>,
    ) -> Result<EditResult> {
        self.check_writable()?;
        let at = self.now();
        let sv1 = self.resolve_supervoxel(edge[0], source_coord, at)?;
        let sv2 = self.resolve_supervoxel(edge[1], sink_coord, at)?;
        if sv1 == sv2 {
            return Err(ChunkedGraphError::BadRequest(
                "cannot merge a supervoxel with itself".into(),
            ));
        }
        let root1 = self.get_root(sv1, at)?;
        let root2 = self.get_root(sv2, at)?;
        if root1 == root2 {
            return Err(ChunkedGraphError::Precondition("same root".into()));
        }

        let operation_id = operation::create_operation_id(self.store())?;
        let locked = self.lock_roots(&[root1, root2], operation_id)?;
        let outcome = self.add_edge_locked(
            operation_id,
            &locked,
            sv1,
            sv2,
            source_coord,
            sink_coord,
            user,
            affinity.unwrap_or(DEFAULT_MERGE_AFFINITY),
        );
        self.unlock_roots(&locked, operation_id);
        outcome
    }

    /// Split: computes the mincut between the source and sink supervoxels,
    /// deactivates the cut edges and rebuilds the affected subtree into the
    /// resulting roots.
    pub fn remove_edges(
        &self,
        sources: &[(NodeId, IVec3)],
        sinks: &[(NodeId, IVec3)],
        user: &str,
    ) -> Result<EditResult> {
        self.check_writable()?;
        if sources.is_empty() || sinks.is_empty() {
            return Err(ChunkedGraphError::BadRequest(
                "split needs at least one source and one sink".into(),
            ));
        }
        let at = self.now();
        let mut source_svs = Vec::with_capacity(sources.len());
        let mut sink_svs = Vec::with_capacity(sinks.len());
        for &(claimed, coord) in sources {
            source_svs.push(self.resolve_supervoxel(claimed, coord, at)?);
        }
        for &(claimed, coord) in sinks {
            sink_svs.push(self.resolve_supervoxel(claimed, coord, at)?);
        }

        let root = self.get_root(source_svs[0], at)?;
        for &sv in source_svs.iter().chain(sink_svs.iter()) {
            if self.get_root(sv, at)? != root {
                return Err(ChunkedGraphError::Precondition(
                    "sources and sinks must share a single root".into(),
                ));
            }
        }

        let operation_id = operation::create_operation_id(self.store())?;
        let locked = self.lock_roots(&[root], operation_id)?;
        let coords_of = |pairs: &[(NodeId, IVec3)]| pairs.iter().map(|&(_, c)| c).collect();
        let outcome = self.remove_edges_locked(
            operation_id,
            &locked,
            &source_svs,
            &sink_svs,
            coords_of(sources),
            coords_of(sinks),
            user,
        );
        self.unlock_roots(&locked, operation_id);
        outcome
    }

    // LOCKING

    /// Acquires leases on the newest descendants of `roots`, all or nothing,
    /// retrying with backoff. Returns the locked (possibly updated) root set.
    pub(crate) fn lock_roots(
        &self,
        roots: &[NodeId],
        operation_id: u64,
    ) -> Result<Vec<NodeId>> {
        for attempt in 0..self.lock_max_tries {
            if attempt > 0 {
                std::thread::sleep(self.lock_backoff);
            }
            // Roots may have been superseded since the caller looked.
            let mut latest = Vec::new();
            for &root in roots {
                latest.extend(self.newest_root_ids(root)?);
            }
            latest.sort_unstable();
            latest.dedup();

            let mut acquired = Vec::new();
            for &root in &latest {
                if lock::lock_root(
                    self.store(),
                    root,
                    operation_id,
                    self.now(),
                    self.lock_expiry_micros,
                )? {
                    acquired.push(root);
                } else {
                    break;
                }
            }
            if acquired.len() == latest.len() {
                // A root retired between the chase and its lock is detected
                // here; retirement happens strictly before unlock.
                let stale = latest
                    .iter()
                    .map(|&root| self.newest_root_ids(root).map(|n| n != [root]))
                    .collect::<Result<Vec<bool>>>()?
                    .into_iter()
                    .any(|s| s);
                if !stale {
                    return Ok(latest);
                }
            }
            for &root in &acquired {
                let _ = lock::unlock_root(self.store(), root, operation_id);
            }
            log::debug!(
                "operation {}: root locks contended, attempt {}",
                operation_id,
                attempt + 1
            );
        }
        Err(ChunkedGraphError::Locking {
            operation_id,
            reason: format!("could not lock roots after {} tries", self.lock_max_tries),
        })
    }

    fn renew_locks(&self, roots: &[NodeId], operation_id: u64) -> Result<()> {
        for &root in roots {
            if !lock::renew_lock(self.store(), root, operation_id, self.now())? {
                return Err(ChunkedGraphError::Locking {
                    operation_id,
                    reason: format!("lease on root {} expired mid-edit", root),
                });
            }
        }
        Ok(())
    }

    fn unlock_roots(&self, roots: &[NodeId], operation_id: u64) {
        for &root in roots {
            match lock::unlock_root(self.store(), root, operation_id) {
                Ok(true) => {}
                Ok(false) => log::warn!(
                    "operation {}: lease on root {} was gone at unlock",
                    operation_id,
                    root
                ),
                Err(e) => log::warn!(
                    "operation {}: failed to release root {}: {}",
                    operation_id,
                    root,
                    e
                ),
            }
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ChunkedGraphError::Unauthorized(
                "graph was opened read-only".into(),
            ));
        }
        Ok(())
    }

    /// Resolves a claimed node at a clicked point to a supervoxel, widening
    /// the search distance step by step.
    fn resolve_supervoxel(&self, claimed: NodeId, coord: IVec3, at: Timestamp) -> Result<NodeId> {
        for dist in LOOKUP_DISTANCES_NM {
            if let Some(svs) = self.get_atomic_ids_from_coords(&[coord], claimed, dist, at)? {
                return Ok(svs[0]);
            }
        }
        Err(ChunkedGraphError::BadRequest(format!(
            "could not determine a supervoxel for node {} at {:?}",
            claimed, coord
        )))
    }

    // MERGE

    #[allow(clippy::too_many_arguments)]
    fn add_edge_locked(
        &self,
        operation_id: u64,
        locked: &[NodeId],
        sv1: NodeId,
        sv2: NodeId,
        source_coord: IVec3,
        sink_coord: IVec3,
        user: &str,
        affinity: f32,
    ) -> Result<EditResult> {
        let timestamp = self.now();
        let root1 = self.get_root(sv1, timestamp)?;
        let root2 = self.get_root(sv2, timestamp)?;
        if root1 == root2 {
            return Err(ChunkedGraphError::Precondition("same root".into()));
        }
        for root in [root1, root2] {
            if !locked.contains(&root) {
                return Err(ChunkedGraphError::Locking {
                    operation_id,
                    reason: format!("root {} changed while locking", root),
                });
            }
        }

        // Toggle the edge on in both adjacency rows, appending the partner
        // when the proofreader drew an edge the agglomeration never proposed.
        let mut mutations = Vec::new();
        let adjacency = self.read_atomic_adjacency(&[sv1, sv2], timestamp)?;
        for (sv, partner) in [(sv1, sv2), (sv2, sv1)] {
            let adj = adjacency.get(&sv).ok_or_else(|| {
                ChunkedGraphError::Internal(format!("supervoxel {} has no adjacency row", sv))
            })?;
            let toggle_index = match adj.partner_index(partner) {
                Some(i) => {
                    if adj.active[i] {
                        return Err(ChunkedGraphError::Internal(format!(
                            "edge between {} and {} is active but their roots differ",
                            sv1, sv2
                        )));
                    }
                    i as u64
                }
                None => {
                    mutations.push(cell(sv, Attribute::AtomicPartners, timestamp, attributes::encode_ids(&[partner])));
                    mutations.push(cell(sv, Attribute::Affinities, timestamp, attributes::encode_f32s(&[affinity])));
                    mutations.push(cell(sv, Attribute::Areas, timestamp, attributes::encode_u64s(&[1])));
                    adj.partners.len() as u64
                }
            };
            mutations.push(cell(sv, Attribute::Connected, timestamp, attributes::encode_u64s(&[toggle_index])));
        }

        let new_edge = Edge {
            node1: sv1,
            node2: sv2,
            affinity,
            area: 1,
        };
        let mut dissolved = SmallKeyHashSet::default();
        for sv in [sv1, sv2] {
            dissolved.insert(self.parent_or_internal(sv, timestamp)?);
        }
        let rebuild = self.rebuild_hierarchy(
            &dissolved,
            &[new_edge],
            &SmallKeyHashSet::default(),
            timestamp,
        )?;
        mutations.extend(rebuild.mutations.iter().cloned());

        let record = OperationRecord {
            operation_id,
            kind: OperationKind::Merge,
            user: user.to_string(),
            source_ids: vec![sv1.0],
            sink_ids: vec![sv2.0],
            source_coords: vec![source_coord.to_array()],
            sink_coords: vec![sink_coord.to_array()],
            added_edges: vec![[sv1.0, sv2.0]],
            removed_edges: vec![],
            old_root_ids: rebuild.old_roots.iter().map(|r| r.0).collect(),
            new_root_ids: rebuild.new_roots.iter().map(|r| r.0).collect(),
            timestamp,
        };
        self.commit(operation_id, locked, &rebuild, mutations, &record, timestamp)?;
        Ok(EditResult {
            operation_id,
            timestamp,
            new_root_ids: rebuild.new_roots,
        })
    }

    // SPLIT

    #[allow(clippy::too_many_arguments)]
    fn remove_edges_locked(
        &self,
        operation_id: u64,
        locked: &[NodeId],
        source_svs: &[NodeId],
        sink_svs: &[NodeId],
        source_coords: Vec<IVec3>,
        sink_coords: Vec<IVec3>,
        user: &str,
    ) -> Result<EditResult> {
        let timestamp = self.now();
        let root = self.get_root(source_svs[0], timestamp)?;
        for &sv in source_svs.iter().chain(sink_svs.iter()) {
            if self.get_root(sv, timestamp)? != root {
                return Err(ChunkedGraphError::Precondition(
                    "sources and sinks must share a single root".into(),
                ));
            }
        }
        if !locked.contains(&root) {
            return Err(ChunkedGraphError::Locking {
                operation_id,
                reason: format!("root {} changed while locking", root),
            });
        }

        // The local graph: everything active under the root within the box
        // around the clicked points, padded by one chunk.
        let points: Vec<IVec3> = source_coords.iter().chain(sink_coords.iter()).copied().collect();
        let bbox = coords::pad_extent_by_chunks(self.meta(), &coords::enclosing_extent(&points), 1);
        let local = self.get_subgraph(root, &bbox, timestamp)?;
        let cut = cutting::mincut(&local, source_svs, sink_svs)?;
        if cut.is_empty() {
            return Err(ChunkedGraphError::Precondition(
                "sources and sinks are already separated".into(),
            ));
        }
        log::debug!(
            "operation {}: cutting {} edges under root {}",
            operation_id,
            cut.len(),
            root
        );

        let mut endpoints: Vec<NodeId> = cut.iter().flatten().copied().collect();
        endpoints.sort_unstable();
        endpoints.dedup();
        let adjacency = self.read_atomic_adjacency(&endpoints, timestamp)?;
        let mut mutations = Vec::new();
        for &[a, b] in &cut {
            for (sv, partner) in [(a, b), (b, a)] {
                let adj = adjacency.get(&sv).ok_or_else(|| {
                    ChunkedGraphError::Internal(format!("supervoxel {} has no adjacency row", sv))
                })?;
                let index = adj.partner_index(partner).ok_or_else(|| {
                    ChunkedGraphError::Internal(format!(
                        "cut edge [{}, {}] is missing from the adjacency",
                        sv, partner
                    ))
                })?;
                if !adj.active[index] {
                    return Err(ChunkedGraphError::Internal(format!(
                        "cut edge [{}, {}] is already inactive",
                        sv, partner
                    )));
                }
                mutations.push(cell(sv, Attribute::Connected, timestamp, attributes::encode_u64s(&[index as u64])));
            }
        }

        let removed: SmallKeyHashSet<(u64, u64)> =
            cut.iter().map(|&[a, b]| ordered(a.0, b.0)).collect();
        let mut dissolved = SmallKeyHashSet::default();
        for &sv in &endpoints {
            dissolved.insert(self.parent_or_internal(sv, timestamp)?);
        }
        let rebuild = self.rebuild_hierarchy(&dissolved, &[], &removed, timestamp)?;
        mutations.extend(rebuild.mutations.iter().cloned());

        let record = OperationRecord {
            operation_id,
            kind: OperationKind::Split,
            user: user.to_string(),
            source_ids: source_svs.iter().map(|s| s.0).collect(),
            sink_ids: sink_svs.iter().map(|s| s.0).collect(),
            source_coords: source_coords.iter().map(|c| c.to_array()).collect(),
            sink_coords: sink_coords.iter().map(|c| c.to_array()).collect(),
            added_edges: vec![],
            removed_edges: cut.iter().map(|&[a, b]| [a.0, b.0]).collect(),
            old_root_ids: rebuild.old_roots.iter().map(|r| r.0).collect(),
            new_root_ids: rebuild.new_roots.iter().map(|r| r.0).collect(),
            timestamp,
        };
        self.commit(operation_id, locked, &rebuild, mutations, &record, timestamp)?;
        Ok(EditResult {
            operation_id,
            timestamp,
            new_root_ids: rebuild.new_roots,
        })
    }

    /// Appends the history linkage and log record, renews the leases and
    /// writes everything. This is the commit point of an edit.
    fn commit(
        &self,
        operation_id: u64,
        locked: &[NodeId],
        rebuild: &RebuildOutcome,
        mut mutations: Vec<Mutation>,
        record: &OperationRecord,
        timestamp: Timestamp,
    ) -> Result<()> {
        for &old in &rebuild.old_roots {
            mutations.push(cell(
                old,
                Attribute::NewRoots,
                timestamp,
                attributes::encode_ids(&rebuild.new_roots),
            ));
        }
        for &new in &rebuild.new_roots {
            mutations.push(cell(
                new,
                Attribute::FormerRoots,
                timestamp,
                attributes::encode_ids(&rebuild.old_roots),
            ));
        }
        mutations.push(operation::operation_mutation(record));

        self.renew_locks(locked, operation_id)?;
        self.store().bulk_mutate(&mutations)
    }

    fn parent_or_internal(&self, sv: NodeId, at: Timestamp) -> Result<NodeId> {
        self.get_parent(sv, at)?.ok_or_else(|| {
            ChunkedGraphError::Internal(format!("supervoxel {} has no parent", sv))
        })
    }

    // REBUILD

    /// Recomputes the smallest subtree invalidated by an adjacency change.
    ///
    /// `dissolved_l2` names the layer-2 nodes whose supervoxel partitioning
    /// may have changed; `added` and `removed` describe atomic edges whose new
    /// state is not yet visible in the store. Layer 2 is recomputed per chunk
    /// from the adjacency; every layer above re-groups the replacement nodes
    /// and their siblings with the same union-find the bulk builder uses.
    /// Nothing is written here; the mutations come back ordered so that every
    /// node row precedes its children's parent pointers.
    fn rebuild_hierarchy(
        &self,
        dissolved_l2: &SmallKeyHashSet<NodeId>,
        added: &[Edge],
        removed: &SmallKeyHashSet<(u64, u64)>,
        timestamp: Timestamp,
    ) -> Result<RebuildOutcome> {
        let meta = self.meta();
        let top = meta.top_layer();
        let mut mutations = Vec::new();
        // Cross-edge maps of nodes that exist only in `mutations` so far.
        let mut overlay: SmallKeyHashMap<NodeId, CrossEdgeMap> = SmallKeyHashMap::default();
        // New nodes still waiting for a parent.
        let mut fresh: Vec<NodeId> = Vec::new();
        // Replaced nodes, across all layers.
        let mut retired: SmallKeyHashSet<NodeId> = dissolved_l2.clone();
        // Replaced nodes whose old parent has not been dissolved yet.
        let mut awaiting: Vec<NodeId> = dissolved_l2.iter().copied().collect();
        awaiting.sort_unstable();

        // Layer 2: recompute each affected chunk's components from the
        // adjacency, with the pending edge changes applied on top.
        let mut by_chunk: SmallKeyHashMap<crate::id::ChunkId, Vec<NodeId>> =
            SmallKeyHashMap::default();
        for &l2 in dissolved_l2 {
            by_chunk.entry(meta.chunk_id_of(l2)).or_default().push(l2);
        }
        let mut chunks: Vec<_> = by_chunk.into_iter().collect();
        chunks.sort_unstable_by_key(|(chunk, _)| *chunk);
        for (chunk2, old_l2s) in chunks {
            let coord = meta.chunk_coord_of(chunk2);
            let mut svs = Vec::new();
            for &l2 in &old_l2s {
                svs.extend(self.get_children(l2)?);
            }
            svs.sort_unstable();
            svs.dedup();
            let index_of: SmallKeyHashMap<NodeId, u32> = svs
                .iter()
                .enumerate()
                .map(|(i, &sv)| (sv, i as u32))
                .collect();
            let adjacency = self.read_atomic_adjacency(&svs, timestamp)?;

            let mut sets = DisjointSets::new(svs.len());
            for (i, &sv) in svs.iter().enumerate() {
                let adj = adjacency.get(&sv).ok_or_else(|| {
                    ChunkedGraphError::Internal(format!("supervoxel {} has no adjacency row", sv))
                })?;
                for (_, partner) in adj.active_partners() {
                    if removed.contains(&ordered(sv.0, partner.0)) {
                        continue;
                    }
                    if let Some(&j) = index_of.get(&partner) {
                        sets.union(i as u32, j);
                    }
                }
            }
            for e in added {
                if let (Some(&i), Some(&j)) = (index_of.get(&e.node1), index_of.get(&e.node2)) {
                    sets.union(i, j);
                }
            }

            let components = sets.into_components();
            let new_ids = self.create_node_ids(chunk2, components.len() as u64)?;
            for (component, &l2_id) in components.iter().zip(&new_ids) {
                let members: Vec<NodeId> = component.iter().map(|&i| svs[i as usize]).collect();
                let mut cross = CrossEdgeMap::default();
                for &sv in &members {
                    let Some(adj) = adjacency.get(&sv) else { continue };
                    for (_, partner) in adj.active_partners() {
                        if removed.contains(&ordered(sv.0, partner.0)) {
                            continue;
                        }
                        if meta.chunk_coord(partner) != coord {
                            let layer = meta.cross_chunk_layer(sv, partner);
                            cross.entry(layer).or_default().push([sv, partner]);
                        }
                    }
                    for e in added {
                        for (near, far) in [(e.node1, e.node2), (e.node2, e.node1)] {
                            if near == sv && meta.chunk_coord(far) != coord {
                                let layer = meta.cross_chunk_layer(near, far);
                                cross.entry(layer).or_default().push([near, far]);
                            }
                        }
                    }
                }
                push_node_mutations(&mut mutations, l2_id, &members, &cross, timestamp);
                overlay.insert(l2_id, cross);
                fresh.push(l2_id);
            }
        }

        if top == 2 {
            // Single-chunk graphs: the new layer-2 nodes are the new roots.
            let mut old_roots: Vec<NodeId> = dissolved_l2.iter().copied().collect();
            old_roots.sort_unstable();
            fresh.sort_unstable();
            return Ok(RebuildOutcome {
                new_roots: fresh,
                old_roots,
                mutations,
            });
        }

        // Upward pass: at each layer, dissolve the old parents of everything
        // replaced below, then regroup their surviving children together with
        // the replacements.
        let mut old_roots = Vec::new();
        let mut new_roots = Vec::new();
        for layer in 3..=top {
            let mut dissolve: Vec<NodeId> = Vec::new();
            let mut still_awaiting = Vec::new();
            for &node in &awaiting {
                match self.get_parent(node, timestamp)? {
                    Some(parent) if meta.layer_of(parent) == layer => {
                        if !dissolve.contains(&parent) {
                            dissolve.push(parent);
                        }
                    }
                    Some(_) => still_awaiting.push(node),
                    None => {
                        return Err(ChunkedGraphError::Internal(format!(
                            "replaced node {} below the top layer has no parent",
                            node
                        )))
                    }
                }
            }
            awaiting = still_awaiting;

            let mut candidates: Vec<NodeId> = fresh.clone();
            for &parent in &dissolve {
                for child in self.get_children(parent)? {
                    if !retired.contains(&child) {
                        candidates.push(child);
                    }
                }
            }
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_unstable();
            candidates.dedup();

            let mut by_parent_chunk: SmallKeyHashMap<crate::id::ChunkId, Vec<NodeId>> =
                SmallKeyHashMap::default();
            for &c in &candidates {
                by_parent_chunk
                    .entry(meta.ancestor_chunk(c, layer))
                    .or_default()
                    .push(c);
            }
            let mut groups: Vec<_> = by_parent_chunk.into_iter().collect();
            groups.sort_unstable_by_key(|(chunk, _)| *chunk);

            fresh = Vec::new();
            for (parent_chunk, group) in groups {
                let united = unite_components(&group, layer, &mut |n| match overlay.get(&n) {
                    Some(map) => Ok(map.clone()),
                    None => self.get_cross_chunk_edges(n),
                })?;
                for (members, cross) in united.members.iter().zip(&united.cross) {
                    if meta.use_skip_connections && layer < top && members.len() == 1 {
                        // Promoted; it keeps looking for company above.
                        fresh.push(members[0]);
                        continue;
                    }
                    let node_id = self.create_node_id(parent_chunk)?;
                    push_node_mutations(&mut mutations, node_id, members, cross, timestamp);
                    overlay.insert(node_id, cross.clone());
                    fresh.push(node_id);
                    if layer == top {
                        new_roots.push(node_id);
                    }
                }
            }

            retired.extend(dissolve.iter().copied());
            if layer == top {
                old_roots = dissolve;
            } else {
                awaiting.extend(dissolve);
            }
        }

        if new_roots.is_empty() || old_roots.is_empty() {
            return Err(ChunkedGraphError::Internal(
                "rebuild did not reach the top layer".into(),
            ));
        }
        old_roots.sort_unstable();
        new_roots.sort_unstable();
        Ok(RebuildOutcome {
            new_roots,
            old_roots,
            mutations,
        })
    }
}

fn cell(id: NodeId, attribute: Attribute, timestamp: Timestamp, value: Vec<u8>) -> Mutation {
    Mutation {
        row: RowKey::Id(id),
        attribute,
        timestamp,
        value,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::edges::INSEPARABLE_AFFINITY;
    use crate::ingest::{add_atomic_chunk, build_hierarchy, AtomicChunkInput};
    use crate::meta::{ChunkedGraphMeta, GraphSources};

    use chunkedgraph_core::ilattice::prelude::Extent;

    fn new_graph(grid_shape: [u32; 3]) -> (sled::Db, ChunkedGraph) {
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

    /// A point well inside chunk (0,0,0).
    fn p0() -> IVec3 {
        IVec3::new(10, 10, 10)
    }

    /// A point well inside chunk (1,0,0).
    fn p1() -> IVec3 {
        IVec3::new(70, 10, 10)
    }

    fn push_edge(edges: &mut crate::edges::Edges, a: NodeId, b: NodeId, affinity: f32) {
        edges.push(Edge {
            node1: a,
            node2: b,
            affinity,
            area: 1,
        });
    }

    /// The toy graph: supervoxels 100..102 and 200..201 in chunk (0,0,0) with
    /// two active components and no cross-chunk edges.
    fn seed_two_components(graph: &ChunkedGraph) {
        let s = |seg| sv(graph, [0, 0, 0], seg);
        let mut input = AtomicChunkInput::default();
        push_edge(&mut input.in_chunk, s(100), s(101), 1.0);
        push_edge(&mut input.in_chunk, s(101), s(102), 0.5);
        push_edge(&mut input.in_chunk, s(200), s(201), 0.9);
        for (seg, component) in [(100, 0), (101, 0), (102, 0), (200, 1), (201, 1)] {
            input.component_map.insert(s(seg), component);
        }
        add_atomic_chunk(graph, IVec3::ZERO, &input).unwrap();
        build_hierarchy(graph, &[IVec3::ZERO, IVec3::new(1, 0, 0)]).unwrap();
    }

    /// The toy graph plus supervoxel 103 in chunk (1,0,0), fused to 102 by an
    /// inseparable cross-chunk edge.
    fn seed_with_inseparable_neighbor(graph: &ChunkedGraph) {
        let s0 = |seg| sv(graph, [0, 0, 0], seg);
        let s1 = |seg| sv(graph, [1, 0, 0], seg);

        let mut left = AtomicChunkInput::default();
        push_edge(&mut left.in_chunk, s0(100), s0(101), 1.0);
        push_edge(&mut left.in_chunk, s0(101), s0(102), 0.5);
        push_edge(&mut left.in_chunk, s0(200), s0(201), 0.9);
        push_edge(&mut left.cross_chunk, s0(102), s1(103), INSEPARABLE_AFFINITY);
        for (seg, component) in [(100, 0), (101, 0), (102, 0), (200, 1), (201, 1)] {
            left.component_map.insert(s0(seg), component);
        }
        left.component_map.insert(s1(103), 0);

        let mut right = AtomicChunkInput::default();
        push_edge(&mut right.cross_chunk, s1(103), s0(102), INSEPARABLE_AFFINITY);
        right.component_map.insert(s1(103), 0);
        right.component_map.insert(s0(102), 0);

        add_atomic_chunk(graph, IVec3::ZERO, &left).unwrap();
        add_atomic_chunk(graph, IVec3::new(1, 0, 0), &right).unwrap();
        build_hierarchy(graph, &[IVec3::ZERO, IVec3::new(1, 0, 0)]).unwrap();
    }

    #[test]
    fn toy_graph_has_two_roots() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);
        let now = graph.now();

        let root_a = graph.get_root(s(100), now).unwrap();
        assert_eq!(graph.get_root(s(101), now).unwrap(), root_a);
        assert_eq!(graph.get_root(s(102), now).unwrap(), root_a);
        let root_b = graph.get_root(s(200), now).unwrap();
        assert_eq!(graph.get_root(s(201), now).unwrap(), root_b);
        assert_ne!(root_a, root_b);
    }

    #[test]
    fn merge_links_history_in_both_directions() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);

        let before = graph.now();
        let root_a = graph.get_root(s(100), before).unwrap();
        let root_b = graph.get_root(s(200), before).unwrap();

        let result = graph
            .add_edge([s(102), s(200)], p0(), p0(), "proofreader", None)
            .unwrap();
        assert_eq!(result.new_root_ids.len(), 1);
        let new_root = result.new_root_ids[0];

        let now = graph.now();
        for seg in [100, 101, 102, 200, 201] {
            assert_eq!(graph.get_root(s(seg), now).unwrap(), new_root);
        }

        let mut former = graph.get_past_root_ids(new_root, 0).unwrap();
        former.sort_unstable();
        let mut expected = vec![root_a, root_b];
        expected.sort_unstable();
        assert_eq!(former, expected);
        assert_eq!(
            graph.get_future_root_ids(root_a, u64::MAX).unwrap(),
            vec![new_root]
        );
        assert_eq!(
            graph.get_future_root_ids(root_b, u64::MAX).unwrap(),
            vec![new_root]
        );

        // Timestamped reads still see the pre-merge state.
        assert_eq!(graph.get_root(s(100), before).unwrap(), root_a);
        assert_eq!(graph.get_root(s(200), before).unwrap(), root_b);

        let record = graph.get_operation(result.operation_id).unwrap().unwrap();
        assert_eq!(record.kind, OperationKind::Merge);
        assert_eq!(record.new_root_ids, vec![new_root.0]);
    }

    #[test]
    fn split_after_merge_restores_the_partition() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);

        graph
            .add_edge([s(102), s(200)], p0(), p0(), "proofreader", None)
            .unwrap();

        // The merge edge has the weakest affinity on the only bridge, so the
        // mincut between 100 and 201 removes exactly it.
        let result = graph
            .remove_edges(&[(s(100), p0())], &[(s(201), p0())], "proofreader")
            .unwrap();
        assert_eq!(result.new_root_ids.len(), 2);

        let now = graph.now();
        let root_a = graph.get_root(s(100), now).unwrap();
        assert_eq!(graph.get_root(s(101), now).unwrap(), root_a);
        assert_eq!(graph.get_root(s(102), now).unwrap(), root_a);
        let root_b = graph.get_root(s(200), now).unwrap();
        assert_eq!(graph.get_root(s(201), now).unwrap(), root_b);
        assert_ne!(root_a, root_b);

        let record = graph.get_operation(result.operation_id).unwrap().unwrap();
        assert_eq!(record.kind, OperationKind::Split);
        assert_eq!(record.removed_edges, vec![[s(102).0, s(200).0]]);
        // The toggled edge still exists, inactive.
        assert_eq!(
            graph.get_edges_status(&[[s(102), s(200)]], now).unwrap(),
            vec![(true, false)]
        );
    }

    #[test]
    fn same_root_merge_is_rejected_without_writes() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);

        let ops_before = graph.get_max_operation_id().unwrap();
        let err = graph
            .add_edge([s(102), s(100)], p0(), p0(), "proofreader", None)
            .unwrap_err();
        assert!(matches!(err, ChunkedGraphError::Precondition(ref m) if m == "same root"));
        assert_eq!(graph.get_max_operation_id().unwrap(), ops_before);

        let now = graph.now();
        // No edge row appeared between 102 and 100.
        assert_eq!(
            graph.get_edges_status(&[[s(102), s(100)]], now).unwrap(),
            vec![(false, false)]
        );
    }

    #[test]
    fn inseparable_endpoints_fail_the_split() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_with_inseparable_neighbor(&graph);
        let s0 = |seg| sv(&graph, [0, 0, 0], seg);
        let s1 = |seg| sv(&graph, [1, 0, 0], seg);

        let err = graph
            .remove_edges(&[(s0(102), p0())], &[(s1(103), p1())], "proofreader")
            .unwrap_err();
        assert!(matches!(err, ChunkedGraphError::Precondition(_)));

        // The fused pair survives any split around it: separating 100 from
        // 103 cuts the weakest finite edge instead.
        let result = graph
            .remove_edges(&[(s0(100), p0())], &[(s1(103), p1())], "proofreader")
            .unwrap();
        let now = graph.now();
        assert_eq!(result.new_root_ids.len(), 2);
        assert_eq!(
            graph.get_root(s0(102), now).unwrap(),
            graph.get_root(s1(103), now).unwrap()
        );
        assert_ne!(
            graph.get_root(s0(100), now).unwrap(),
            graph.get_root(s0(102), now).unwrap()
        );
        let record = graph.get_operation(result.operation_id).unwrap().unwrap();
        assert_eq!(record.removed_edges, vec![[s0(101).0, s0(102).0]]);
    }

    #[test]
    fn overlapping_sources_and_sinks_are_a_bad_request() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);
        let err = graph
            .remove_edges(&[(s(100), p0())], &[(s(100), p0())], "proofreader")
            .unwrap_err();
        assert!(matches!(err, ChunkedGraphError::BadRequest(_)));
    }

    #[test]
    fn empty_bounding_boxes_yield_empty_subgraphs() {
        let (_db, graph) = new_graph([2, 1, 1]);
        seed_two_components(&graph);
        let s = |seg| sv(&graph, [0, 0, 0], seg);
        let now = graph.now();
        let root = graph.get_root(s(100), now).unwrap();

        let far_away = Extent::from_min_and_shape(IVec3::new(100, 100, 100), IVec3::splat(4));
        assert!(graph.get_subgraph(root, &far_away, now).unwrap().is_empty());
    }

    #[test]
    fn read_only_graphs_refuse_edits() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let meta = ChunkedGraphMeta::new(
            "test",
            [64, 64, 64],
            [4, 4, 40],
            [2, 1, 1],
            2,
            true,
            GraphSources::default(),
        )
        .unwrap();
        {
            let graph = ChunkedGraph::create(&db, meta, &RuntimeConfig::default()).unwrap();
            seed_two_components(&graph);
        }
        let config = RuntimeConfig {
            read_only: true,
            ..RuntimeConfig::default()
        };
        let graph = ChunkedGraph::open(&db, "test", &config).unwrap();
        let s = |seg| sv(&graph, [0, 0, 0], seg);
        let err = graph
            .add_edge([s(102), s(200)], p0(), p0(), "proofreader", None)
            .unwrap_err();
        assert!(matches!(err, ChunkedGraphError::Unauthorized(_)));
    }

    /// Concurrent merges on disjoint root pairs must all succeed and leave
    /// contiguous, monotone operation ids behind.
    #[test]
    fn concurrent_merges_on_disjoint_roots_all_succeed() {
        const PAIRS: u64 = 100;
        let (_db, graph) = new_graph([1, 1, 1]);
        let s = |seg| sv(&graph, [0, 0, 0], seg);

        let mut input = AtomicChunkInput::default();
        for seg in 1..=2 * PAIRS {
            input.component_map.insert(s(seg), seg);
        }
        add_atomic_chunk(&graph, IVec3::ZERO, &input).unwrap();

        let graph_ref = &graph;
        crossbeam::scope(|scope| {
            for i in 0..PAIRS {
                scope.spawn(move |_| {
                    graph_ref
                        .add_edge(
                            [s(2 * i + 1), s(2 * i + 2)],
                            p0(),
                            p0(),
                            "proofreader",
                            Some(0.5),
                        )
                        .unwrap();
                });
            }
        })
        .unwrap();

        let now = graph.now();
        for i in 0..PAIRS {
            let root = graph.get_root(s(2 * i + 1), now).unwrap();
            assert_eq!(graph.get_root(s(2 * i + 2), now).unwrap(), root);
            // Children and parents agree at the final state.
            for child in graph.get_children(root).unwrap() {
                assert_eq!(graph.get_parent(child, now).unwrap(), Some(root));
            }
        }

        assert_eq!(graph.get_max_operation_id().unwrap(), PAIRS);
        for operation_id in 1..=PAIRS {
            assert!(graph.get_operation(operation_id).unwrap().is_some());
        }
    }
}
