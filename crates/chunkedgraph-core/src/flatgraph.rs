use crate::unionfind::DisjointSets;

/// An undirected graph over sparse `u64` node ids, relabeled to the dense indices
/// `0..node_count`. The dense indices are what the flow and component algorithms
/// operate on; callers translate back with [`FlatGraph::id_of`].
pub struct FlatGraph {
    /// Sorted, deduplicated original ids; the dense index of an id is its position here.
    ids: Vec<u64>,
    /// Unique undirected edges as dense index pairs, `[small, large]`.
    edges: Vec<[u32; 2]>,
    weights: Vec<f32>,
}

impl FlatGraph {
    /// Builds the graph from an edge list with parallel weights. Parallel edges are
    /// kept (their capacities add up in a flow network).
    pub fn build(edge_list: &[[u64; 2]], weights: &[f32]) -> Self {
        assert_eq!(edge_list.len(), weights.len());
        let mut ids: Vec<u64> = edge_list.iter().flatten().copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let index_of = |id: u64| ids.binary_search(&id).unwrap() as u32;
        let edges = edge_list
            .iter()
            .map(|&[u, v]| {
                let (iu, iv) = (index_of(u), index_of(v));
                [iu.min(iv), iu.max(iv)]
            })
            .collect();

        Self {
            ids,
            edges,
            weights: weights.to_vec(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn index_of(&self, id: u64) -> Option<u32> {
        self.ids.binary_search(&id).ok().map(|i| i as u32)
    }

    pub fn id_of(&self, index: u32) -> u64 {
        self.ids[index as usize]
    }

    pub fn edges(&self) -> &[[u32; 2]] {
        &self.edges
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Connected components as lists of dense indices, ordered by smallest member.
    pub fn connected_components(&self) -> Vec<Vec<u32>> {
        let mut sets = DisjointSets::new(self.node_count());
        for &[u, v] in &self.edges {
            sets.union(u, v);
        }
        sets.into_components()
    }

    /// Per-node component label; two nodes share a label iff they are connected.
    /// `skip` marks edges to leave out of the connectivity.
    pub fn component_labels(&self, skip: &[bool]) -> Vec<u32> {
        assert_eq!(skip.len(), self.edges.len());
        let mut sets = DisjointSets::new(self.node_count());
        for (i, &[u, v]) in self.edges.iter().enumerate() {
            if !skip[i] {
                sets.union(u, v);
            }
        }
        let mut labels = vec![0; self.node_count()];
        for x in 0..self.node_count() as u32 {
            labels[x as usize] = sets.find(x);
        }
        labels
    }
}
