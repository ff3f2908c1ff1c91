use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::graph::ChunkedGraph;
use crate::meta::ChunkedGraphMeta;

use chunkedgraph_core::SmallKeyHashMap;
use parking_lot::Mutex;

use std::sync::Arc;

/// Owns the process-wide database handle and a cache of open graphs. Created
/// at startup and dropped at shutdown by whoever embeds the engine; there are
/// no hidden singletons behind it.
pub struct GraphRegistry {
    db: sled::Db,
    config: RuntimeConfig,
    graphs: Mutex<SmallKeyHashMap<String, Arc<ChunkedGraph>>>,
}

impl GraphRegistry {
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        let db = sled::Config::default()
            .path(&config.db_path)
            .cache_capacity(config.cache_capacity)
            .open()?;
        Ok(Self::with_db(db, config))
    }

    /// Wraps an already-open database; used by embedders that manage their own
    /// sled instance and by tests with temporary databases.
    pub fn with_db(db: sled::Db, config: RuntimeConfig) -> Self {
        Self {
            db,
            config,
            graphs: Mutex::new(SmallKeyHashMap::default()),
        }
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn create_graph(&self, meta: ChunkedGraphMeta) -> Result<Arc<ChunkedGraph>> {
        let name = meta.graph_name.clone();
        let graph = Arc::new(ChunkedGraph::create(&self.db, meta, &self.config)?);
        self.graphs.lock().insert(name, graph.clone());
        Ok(graph)
    }

    /// Opens (or returns the cached handle of) the named graph.
    pub fn graph(&self, name: &str) -> Result<Arc<ChunkedGraph>> {
        if let Some(graph) = self.graphs.lock().get(name) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(ChunkedGraph::open(&self.db, name, &self.config)?);
        self.graphs.lock().insert(name.to_string(), graph.clone());
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::GraphSources;

    #[test]
    fn graphs_are_cached_by_name() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let registry = GraphRegistry::with_db(db, RuntimeConfig::default());

        assert!(registry.graph("missing").is_err());

        let meta = ChunkedGraphMeta::new(
            "mygraph",
            [64, 64, 64],
            [4, 4, 40],
            [2, 1, 1],
            2,
            true,
            GraphSources::default(),
        )
        .unwrap();
        let created = registry.create_graph(meta.clone()).unwrap();
        let reopened = registry.graph("mygraph").unwrap();
        assert!(Arc::ptr_eq(&created, &reopened));

        // Creating the same graph twice is refused.
        assert!(registry.create_graph(meta).is_err());
    }
}
