pub mod flatgraph;
pub mod maxflow;
pub mod unionfind;

use ahash::{AHashMap, AHashSet};
pub type SmallKeyHashMap<K, V> = AHashMap<K, V>;
pub type SmallKeyHashSet<K> = AHashSet<K>;

// Re-exports.
pub use ilattice;
pub use ilattice::glam;
pub use static_assertions;
