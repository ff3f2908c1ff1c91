//! A proofreading graph database for large 3D neuron segmentations.
//!
//! # Data model
//!
//! The volume is tiled into chunks; watershed supervoxels (layer 1) are
//! agglomerated into progressively larger nodes, one octree layer at a time,
//! up to the roots that proofreaders see as neurons. Every node is a row in a
//! versioned column store; every relationship is a timestamped cell, so any
//! past state of the graph can be read back by timestamp.
//!
//! # Edits
//!
//! Proofreaders merge and split neurons interactively. Both edits serialize
//! per root through lease cells in the store, toggle atomic edges in an
//! append-only parity log, and rebuild only the subtree that changed,
//! producing new ids at every affected layer and linking old and new roots
//! into a browsable history. Splits are computed as a max-flow mincut over
//! the local affinity graph.
//!
//! # Storage
//!
//! [`ColumnStore`] realizes a small wide-column contract (timestamped cells,
//! atomic counters, conditional mutations for leases, retried bulk writes)
//! over sled trees, one per column family.

mod attributes;
mod config;
mod coords;
mod cutting;
mod edges;
mod edits;
mod error;
mod graph;
mod id;
mod ingest;
mod meta;
mod operation;
mod registry;
mod store;

pub use attributes::{Attribute, Codec, Family, Retention};
pub use config::RuntimeConfig;
pub use coords::{chunk_extent, chunk_intersects, enclosing_extent, pad_extent_by_chunks};
pub use cutting::mincut;
pub use edges::{
    categorize_edges, merge_cross_edge_maps, CategorizedEdges, CrossEdgeMap, Edge, Edges,
    INSEPARABLE_AFFINITY,
};
pub use edits::{EditResult, DEFAULT_MERGE_AFFINITY};
pub use error::{ChunkedGraphError, Result};
pub use graph::{AtomicAdjacency, ChunkedGraph};
pub use id::{ChunkId, NodeId};
pub use ingest::{add_atomic_chunk, add_layer, build_hierarchy, AtomicChunkInput};
pub use meta::{ChunkedGraphMeta, GraphSources};
pub use operation::{OperationKind, OperationRecord};
pub use registry::GraphRegistry;
pub use store::lock;
pub use store::{Cell, ColumnStore, Mutation, RetryPolicy, RowKey, Timestamp, TimestampOracle};

// Re-exports.
pub use chunkedgraph_core::{glam, ilattice};
