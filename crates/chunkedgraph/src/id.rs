//! The 64-bit node id algebra.
//!
//! An id packs, most significant first: the layer (8 bits), the chunk
//! coordinates (three fields of `spatial_bits(layer)` bits each) and the
//! segment id in the remaining low bits. A chunk id is a node id with segment
//! zero; segment ids are allocated starting at one, so the two never collide.
//! The per-layer coordinate widths come from [`ChunkedGraphMeta::spatial_bits`]
//! and are fixed at graph creation; all processes reading one graph decode ids
//! identically.

use crate::meta::ChunkedGraphMeta;

use chunkedgraph_core::glam::IVec3;
use chunkedgraph_core::static_assertions::const_assert_eq;
use smallvec::SmallVec;

use std::fmt;
use std::mem;

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u64);

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChunkId(pub u64);

// Ids go over the wire and into row keys as bare 64-bit words.
const_assert_eq!(mem::size_of::<NodeId>(), 8);
const_assert_eq!(mem::size_of::<ChunkId>(), 8);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

const LAYER_SHIFT: u32 = 56;

impl ChunkedGraphMeta {
    pub fn spatial_bits_at(&self, layer: u8) -> u32 {
        self.spatial_bits[layer as usize - 1] as u32
    }

    pub fn segment_bits_at(&self, layer: u8) -> u32 {
        LAYER_SHIFT - 3 * self.spatial_bits_at(layer)
    }

    /// Largest segment id representable at `layer`.
    pub fn max_segment_at(&self, layer: u8) -> u64 {
        mask(self.segment_bits_at(layer))
    }

    pub fn pack(&self, layer: u8, coord: IVec3, segment: u64) -> NodeId {
        let sb = self.spatial_bits_at(layer);
        debug_assert!(layer >= 1 && layer <= self.layer_count);
        debug_assert!(coord.cmpge(IVec3::ZERO).all());
        debug_assert!(
            coord.max_element() < (1i64 << sb) as i32,
            "coordinate {} out of range at layer {}",
            coord,
            layer
        );
        debug_assert!(segment <= self.max_segment_at(layer));
        let x = coord.x as u64;
        let y = coord.y as u64;
        let z = coord.z as u64;
        NodeId(
            ((layer as u64) << LAYER_SHIFT)
                | (x << (LAYER_SHIFT - sb))
                | (y << (LAYER_SHIFT - 2 * sb))
                | (z << (LAYER_SHIFT - 3 * sb))
                | segment,
        )
    }

    pub fn layer_of(&self, id: NodeId) -> u8 {
        (id.0 >> LAYER_SHIFT) as u8
    }

    pub fn chunk_coord(&self, id: NodeId) -> IVec3 {
        let sb = self.spatial_bits_at(self.layer_of(id));
        let m = mask(sb);
        IVec3::new(
            ((id.0 >> (LAYER_SHIFT - sb)) & m) as i32,
            ((id.0 >> (LAYER_SHIFT - 2 * sb)) & m) as i32,
            ((id.0 >> (LAYER_SHIFT - 3 * sb)) & m) as i32,
        )
    }

    pub fn segment_of(&self, id: NodeId) -> u64 {
        id.0 & mask(self.segment_bits_at(self.layer_of(id)))
    }

    pub fn chunk_id_of(&self, id: NodeId) -> ChunkId {
        ChunkId(id.0 & !mask(self.segment_bits_at(self.layer_of(id))))
    }

    pub fn chunk_id(&self, layer: u8, coord: IVec3) -> ChunkId {
        ChunkId(self.pack(layer, coord, 0).0)
    }

    pub fn chunk_layer(&self, chunk: ChunkId) -> u8 {
        self.layer_of(NodeId(chunk.0))
    }

    pub fn chunk_coord_of(&self, chunk: ChunkId) -> IVec3 {
        self.chunk_coord(NodeId(chunk.0))
    }

    /// The enclosing chunk one layer up. Layer-2 chunks share the layer-1 grid.
    pub fn parent_chunk(&self, chunk: ChunkId) -> ChunkId {
        let layer = self.chunk_layer(chunk);
        debug_assert!(layer < self.layer_count);
        let coord = self.chunk_coord_of(chunk);
        if layer == 1 {
            self.chunk_id(2, coord)
        } else {
            self.chunk_id(layer + 1, coord / self.fanout as i32)
        }
    }

    /// All child chunks that exist within the grid at the layer below.
    pub fn child_chunks(&self, chunk: ChunkId) -> SmallVec<[ChunkId; 8]> {
        let layer = self.chunk_layer(chunk);
        debug_assert!(layer >= 2);
        let coord = self.chunk_coord_of(chunk);
        if layer == 2 {
            return SmallVec::from_slice(&[self.chunk_id(1, coord)]);
        }
        let child_layer = layer - 1;
        let f = self.fanout as i32;
        let grid = self.grid_shape_at(child_layer);
        let min = coord * f;
        let mut children = SmallVec::new();
        for dx in 0..f {
            for dy in 0..f {
                for dz in 0..f {
                    let c = min + IVec3::new(dx, dy, dz);
                    if (c.x as u32) < grid[0] && (c.y as u32) < grid[1] && (c.z as u32) < grid[2] {
                        children.push(self.chunk_id(child_layer, c));
                    }
                }
            }
        }
        children
    }

    /// The chunk at `layer` containing `id`'s chunk. `id` may live at any
    /// layer below (skip connections leave children several layers down).
    pub fn ancestor_chunk(&self, id: NodeId, layer: u8) -> ChunkId {
        let own_layer = self.layer_of(id).max(2);
        debug_assert!(layer >= own_layer);
        let steps = (layer - own_layer) as u32;
        let divisor = (self.fanout as i32).pow(steps);
        self.chunk_id(layer, self.chunk_coord(id) / divisor)
    }

    /// Inclusive id range of every node that can live in `chunk`. Row scans
    /// over this range enumerate a chunk's nodes.
    pub fn chunk_node_range(&self, chunk: ChunkId) -> (NodeId, NodeId) {
        let layer = self.chunk_layer(chunk);
        (
            NodeId(chunk.0 + 1),
            NodeId(chunk.0 + self.max_segment_at(layer)),
        )
    }

    /// The layer at which an edge between two supervoxels becomes relevant for
    /// connectivity: 1 when they share a layer-1 chunk, otherwise one layer
    /// below the first common ancestor chunk. Nodes at this layer on both
    /// sides sit in different chunks and get united one layer up.
    pub fn cross_chunk_layer(&self, a: NodeId, b: NodeId) -> u8 {
        let mut ca = self.chunk_coord(a);
        let mut cb = self.chunk_coord(b);
        let f = self.fanout as i32;
        let mut layer = 1u8;
        for _ in 2..self.layer_count {
            if ca != cb {
                layer += 1;
            }
            ca /= f;
            cb /= f;
        }
        layer
    }
}

const fn mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        u64::MAX >> (64 - bits)
    }
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
    use crate::meta::GraphSources;

    fn meta() -> ChunkedGraphMeta {
        ChunkedGraphMeta::new(
            "test",
            [256, 256, 512],
            [4, 4, 40],
            [8, 8, 4],
            2,
            true,
            GraphSources::default(),
        )
        .unwrap()
    }

    #[test]
    fn pack_round_trips_every_field() {
        let meta = meta();
        for layer in 1..=meta.layer_count {
            let grid = meta.grid_shape_at(layer);
            let coord = IVec3::new(grid[0] as i32 - 1, 0, grid[2] as i32 - 1);
            let id = meta.pack(layer, coord, 7);
            assert_eq!(meta.layer_of(id), layer);
            assert_eq!(meta.chunk_coord(id), coord);
            assert_eq!(meta.segment_of(id), 7);
            assert_eq!(meta.chunk_id_of(id), meta.chunk_id(layer, coord));
        }
    }

    #[test]
    fn ids_order_by_layer_first() {
        let meta = meta();
        let atomic = meta.pack(1, IVec3::new(7, 7, 3), meta.max_segment_at(1));
        let root = meta.pack(meta.layer_count, IVec3::ZERO, 1);
        assert!(atomic < root);
    }

    #[test]
    fn chunk_ids_never_collide_with_allocated_nodes() {
        let meta = meta();
        let chunk = meta.chunk_id(1, IVec3::new(1, 2, 3));
        // Segments start at 1, so the chunk row (segment 0) is reserved.
        assert_eq!(meta.segment_of(NodeId(chunk.0)), 0);
    }

    #[test]
    fn parent_and_child_chunks_are_inverse() {
        let meta = meta();
        let parent = meta.chunk_id(3, IVec3::new(1, 1, 0));
        for child in meta.child_chunks(parent) {
            assert_eq!(meta.parent_chunk(child), parent);
        }
        // Layer 1 -> 2 keeps the coordinate.
        let atomic = meta.chunk_id(1, IVec3::new(5, 3, 2));
        assert_eq!(
            meta.parent_chunk(atomic),
            meta.chunk_id(2, IVec3::new(5, 3, 2))
        );
    }

    #[test]
    fn child_chunks_clip_to_the_grid() {
        let meta = meta();
        // Grid at layer 3 is [4, 4, 2]; the chunk at z == 1 has children only
        // at child z in {2, 3} which both exist, but the layer-4 chunk at
        // z == 0 covers layer-3 z in {0, 1} and the grid stops there.
        let top = meta.chunk_id(4, IVec3::new(1, 1, 0));
        assert_eq!(meta.child_chunks(top).len(), 8);
        let edge = meta.chunk_id(5, IVec3::ZERO);
        // Layer-4 grid is [2, 2, 1]: only 4 of 8 children exist.
        assert_eq!(meta.child_chunks(edge).len(), 4);
    }

    #[test]
    fn cross_chunk_layer_counts_divisions_until_agreement() {
        let meta = meta();
        let a = meta.pack(1, IVec3::new(0, 0, 0), 1);
        let same = meta.pack(1, IVec3::new(0, 0, 0), 2);
        let neighbor = meta.pack(1, IVec3::new(1, 0, 0), 1);
        let far = meta.pack(1, IVec3::new(7, 0, 0), 1);

        assert_eq!(meta.cross_chunk_layer(a, same), 1);
        // (0,0,0) and (1,0,0) agree after one division.
        assert_eq!(meta.cross_chunk_layer(a, neighbor), 2);
        // (0,0,0) and (7,0,0) need three divisions.
        assert_eq!(meta.cross_chunk_layer(a, far), 4);
    }
}
