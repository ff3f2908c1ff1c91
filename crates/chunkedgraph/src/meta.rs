use crate::error::{ChunkedGraphError, Result};

use rkyv::{Archive, Deserialize, Serialize};

/// Paths to the external data the graph was built from. Informational only; the
/// engine never dereferences them.
#[derive(Archive, Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GraphSources {
    pub watershed_path: String,
    pub edges_path: String,
    pub components_path: String,
}

/// Every dimensioning decision of a graph, fixed at creation time and stored
/// under the meta row. Readers and writers in other processes must agree on
/// all of this, most importantly the id bit layout derived from
/// `spatial_bits`, so the record is write-once.
#[derive(Archive, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChunkedGraphMeta {
    pub graph_name: String,
    /// Supervoxels live at layer 1; roots at `layer_count`.
    pub layer_count: u8,
    /// Linear branching factor between adjacent layers (2 == octree).
    pub fanout: u8,
    /// Layer-1 chunk shape in voxels.
    pub chunk_size: [u32; 3],
    /// Voxel resolution in nanometers.
    pub resolution: [u32; 3],
    /// Number of layer-1 chunks per dimension.
    pub grid_shape: [u32; 3],
    /// Per-dimension coordinate bit width for each layer, index `layer - 1`.
    pub spatial_bits: Vec<u8>,
    /// Whether sole children are promoted past trivial layers.
    pub use_skip_connections: bool,
    pub sources: GraphSources,
}

impl ChunkedGraphMeta {
    pub fn new(
        graph_name: impl Into<String>,
        chunk_size: [u32; 3],
        resolution: [u32; 3],
        grid_shape: [u32; 3],
        fanout: u8,
        use_skip_connections: bool,
        sources: GraphSources,
    ) -> Result<Self> {
        if fanout < 2 {
            return Err(ChunkedGraphError::BadRequest(format!(
                "fanout must be at least 2, got {}",
                fanout
            )));
        }
        if grid_shape.iter().any(|&d| d == 0) || chunk_size.iter().any(|&d| d == 0) {
            return Err(ChunkedGraphError::BadRequest(
                "chunk size and grid shape must be positive".into(),
            ));
        }

        let atomic_bits = bits_for(grid_shape.into_iter().max().unwrap_or(1)) as u32;
        if 8 + 3 * atomic_bits >= 64 {
            return Err(ChunkedGraphError::BadRequest(format!(
                "grid shape {:?} needs {} coordinate bits per dimension; no room left for segment ids",
                grid_shape, atomic_bits
            )));
        }

        // Layer 2 shares the layer-1 chunk grid (a layer-2 node is one
        // component within a layer-1 chunk); aggregation starts at layer 3.
        let mut layer_count = 2u8;
        let mut dims = grid_shape;
        while dims != [1, 1, 1] {
            layer_count += 1;
            dims = dims.map(|d| div_ceil_u32(d, fanout as u32));
        }

        let mut spatial_bits = Vec::with_capacity(layer_count as usize);
        for layer in 1..=layer_count {
            let dims = grid_shape_at(grid_shape, fanout, layer);
            let max_dim = dims.into_iter().max().unwrap_or(1);
            spatial_bits.push(bits_for(max_dim));
        }

        Ok(Self {
            graph_name: graph_name.into(),
            layer_count,
            fanout,
            chunk_size,
            resolution,
            grid_shape,
            spatial_bits,
            use_skip_connections,
            sources,
        })
    }

    pub fn top_layer(&self) -> u8 {
        self.layer_count
    }

    /// Chunks per dimension at `layer`.
    pub fn grid_shape_at(&self, layer: u8) -> [u32; 3] {
        grid_shape_at(self.grid_shape, self.fanout, layer)
    }
}

pub(crate) fn grid_shape_at(grid_shape: [u32; 3], fanout: u8, layer: u8) -> [u32; 3] {
    if layer <= 2 {
        return grid_shape;
    }
    let divisor = (fanout as u32).pow(layer as u32 - 2);
    grid_shape.map(|d| div_ceil_u32(d, divisor))
}

fn div_ceil_u32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Bits needed to represent the coordinates `0..extent`.
fn bits_for(extent: u32) -> u8 {
    if extent <= 1 {
        0
    } else {
        (32 - (extent - 1).leading_zeros()) as u8
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

    fn meta_with_grid(grid_shape: [u32; 3]) -> ChunkedGraphMeta {
        ChunkedGraphMeta::new(
            "test",
            [256, 256, 512],
            [4, 4, 40],
            grid_shape,
            2,
            true,
            GraphSources::default(),
        )
        .unwrap()
    }

    #[test]
    fn single_chunk_graph_has_two_layers() {
        let meta = meta_with_grid([1, 1, 1]);
        assert_eq!(meta.layer_count, 2);
        assert_eq!(meta.spatial_bits, vec![0, 0]);
    }

    #[test]
    fn layer_count_covers_the_grid() {
        let meta = meta_with_grid([8, 8, 4]);
        // 8 -> 4 -> 2 -> 1 needs three aggregation steps above layer 2.
        assert_eq!(meta.layer_count, 5);
        assert_eq!(meta.spatial_bits, vec![3, 3, 2, 1, 0]);
        assert_eq!(meta.grid_shape_at(3), [4, 4, 2]);
        assert_eq!(meta.grid_shape_at(5), [1, 1, 1]);
    }

    #[test]
    fn uneven_grids_round_up() {
        let meta = meta_with_grid([5, 3, 1]);
        assert_eq!(meta.grid_shape_at(3), [3, 2, 1]);
        assert_eq!(meta.grid_shape_at(4), [2, 1, 1]);
        assert_eq!(meta.grid_shape_at(5), [1, 1, 1]);
        assert_eq!(meta.layer_count, 5);
    }

    #[test]
    fn oversized_grids_are_rejected() {
        let result = ChunkedGraphMeta::new(
            "test",
            [256, 256, 512],
            [4, 4, 40],
            [1 << 20, 1 << 20, 1 << 20],
            2,
            true,
            GraphSources::default(),
        );
        assert!(result.is_err());
    }
}
