//! Chunk geometry in voxel space.

use crate::id::ChunkId;
use crate::meta::ChunkedGraphMeta;

use chunkedgraph_core::glam::IVec3;
use chunkedgraph_core::ilattice::prelude::Extent;

pub fn chunk_size_ivec3(meta: &ChunkedGraphMeta) -> IVec3 {
    IVec3::new(
        meta.chunk_size[0] as i32,
        meta.chunk_size[1] as i32,
        meta.chunk_size[2] as i32,
    )
}

/// Voxel shape of a chunk at `layer`. Layer-2 chunks share the layer-1 shape;
/// every layer above scales by the fanout.
pub fn chunk_shape_at(meta: &ChunkedGraphMeta, layer: u8) -> IVec3 {
    let scale = if layer <= 2 {
        1
    } else {
        (meta.fanout as i32).pow(layer as u32 - 2)
    };
    chunk_size_ivec3(meta) * scale
}

/// The voxel extent covered by `chunk`.
pub fn chunk_extent(meta: &ChunkedGraphMeta, chunk: ChunkId) -> Extent<IVec3> {
    let layer = meta.chunk_layer(chunk);
    let shape = chunk_shape_at(meta, layer);
    Extent::from_min_and_shape(meta.chunk_coord_of(chunk) * shape, shape)
}

pub fn extents_intersect(a: &Extent<IVec3>, b: &Extent<IVec3>) -> bool {
    a.minimum.cmple(b.max()).all() && b.minimum.cmple(a.max()).all()
}

pub fn chunk_intersects(meta: &ChunkedGraphMeta, chunk: ChunkId, bbox: &Extent<IVec3>) -> bool {
    extents_intersect(&chunk_extent(meta, chunk), bbox)
}

/// Layer-1 chunk coordinates of the chunk containing voxel `p`.
pub fn containing_chunk_coord(meta: &ChunkedGraphMeta, p: IVec3) -> IVec3 {
    let size = chunk_size_ivec3(meta);
    IVec3::new(
        p.x.div_euclid(size.x),
        p.y.div_euclid(size.y),
        p.z.div_euclid(size.z),
    )
}

/// The smallest voxel extent containing every point.
pub fn enclosing_extent(points: &[IVec3]) -> Extent<IVec3> {
    debug_assert!(!points.is_empty());
    let mut min = points[0];
    let mut max = points[0];
    for &p in &points[1..] {
        min = min.min(p);
        max = max.max(p);
    }
    Extent::from_min_and_max(min, max)
}

/// Grows an extent by `chunks` layer-1 chunks on every side.
pub fn pad_extent_by_chunks(
    meta: &ChunkedGraphMeta,
    extent: &Extent<IVec3>,
    chunks: i32,
) -> Extent<IVec3> {
    let pad = chunk_size_ivec3(meta) * chunks;
    Extent::from_min_and_max(extent.minimum - pad, extent.max() + pad)
}

/// Distance in nanometers from voxel point `p` to the box of the layer-1 chunk
/// at `coord`; zero when the point lies inside.
pub fn chunk_distance_nm(meta: &ChunkedGraphMeta, coord: IVec3, p: IVec3) -> f64 {
    let size = chunk_size_ivec3(meta);
    let min = coord * size;
    let max = min + size - IVec3::ONE;
    let mut sq = 0f64;
    for d in 0..3 {
        let clamped = p[d].clamp(min[d], max[d]);
        let gap_nm = (p[d] - clamped) as f64 * meta.resolution[d] as f64;
        sq += gap_nm * gap_nm;
    }
    sq.sqrt()
}

/// All layer-1 chunk coordinates within `max_dist_nm` of voxel point `p`,
/// clipped to the grid.
pub fn chunk_coords_near(meta: &ChunkedGraphMeta, p: IVec3, max_dist_nm: f64) -> Vec<IVec3> {
    let size = chunk_size_ivec3(meta);
    let radius_voxels = IVec3::new(
        (max_dist_nm / meta.resolution[0] as f64).ceil() as i32,
        (max_dist_nm / meta.resolution[1] as f64).ceil() as i32,
        (max_dist_nm / meta.resolution[2] as f64).ceil() as i32,
    );
    let lo = containing_chunk_coord(meta, p - radius_voxels);
    let hi = containing_chunk_coord(meta, p + radius_voxels);
    let grid = meta.grid_shape;
    let mut coords = Vec::new();
    for x in lo.x.max(0)..=hi.x.min(grid[0] as i32 - 1) {
        for y in lo.y.max(0)..=hi.y.min(grid[1] as i32 - 1) {
            for z in lo.z.max(0)..=hi.z.min(grid[2] as i32 - 1) {
                let c = IVec3::new(x, y, z);
                if chunk_distance_nm(meta, c, p) <= max_dist_nm {
                    coords.push(c);
                }
            }
        }
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::GraphSources;

    fn meta() -> ChunkedGraphMeta {
        ChunkedGraphMeta::new(
            "test",
            [64, 64, 64],
            [4, 4, 40],
            [4, 4, 4],
            2,
            true,
            GraphSources::default(),
        )
        .unwrap()
    }

    #[test]
    fn chunk_extents_scale_with_layer() {
        let meta = meta();
        let atomic = meta.chunk_id(1, IVec3::new(1, 0, 0));
        assert_eq!(
            chunk_extent(&meta, atomic),
            Extent::from_min_and_shape(IVec3::new(64, 0, 0), IVec3::splat(64))
        );
        // A layer-2 chunk covers the same voxels as its layer-1 chunk.
        let abstract_chunk = meta.chunk_id(2, IVec3::new(1, 0, 0));
        assert_eq!(chunk_extent(&meta, abstract_chunk), chunk_extent(&meta, atomic));
        // Layer 3 doubles the edge length.
        let parent = meta.chunk_id(3, IVec3::ZERO);
        assert_eq!(
            chunk_extent(&meta, parent),
            Extent::from_min_and_shape(IVec3::ZERO, IVec3::splat(128))
        );
    }

    #[test]
    fn empty_intersection_is_detected() {
        let meta = meta();
        let chunk = meta.chunk_id(1, IVec3::ZERO);
        let inside = Extent::from_min_and_shape(IVec3::splat(10), IVec3::splat(4));
        let outside = Extent::from_min_and_shape(IVec3::splat(100), IVec3::splat(4));
        assert!(chunk_intersects(&meta, chunk, &inside));
        assert!(!chunk_intersects(&meta, chunk, &outside));
    }

    #[test]
    fn chunk_distance_is_zero_inside() {
        let meta = meta();
        assert_eq!(chunk_distance_nm(&meta, IVec3::ZERO, IVec3::new(10, 10, 10)), 0.0);
        // One voxel past the x face: 4 nm.
        assert_eq!(
            chunk_distance_nm(&meta, IVec3::ZERO, IVec3::new(64, 10, 10)),
            4.0
        );
    }

    #[test]
    fn nearby_chunks_respect_anisotropic_resolution() {
        let meta = meta();
        let p = IVec3::new(63, 10, 10);
        // 10 nm reaches the x neighbor (4 nm/voxel) but not the z face.
        let coords = chunk_coords_near(&meta, p, 10.0);
        assert!(coords.contains(&IVec3::ZERO));
        assert!(coords.contains(&IVec3::new(1, 0, 0)));
        assert_eq!(coords.len(), 2);
    }
}
