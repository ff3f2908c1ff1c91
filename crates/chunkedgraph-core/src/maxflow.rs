//! FIFO push-relabel max flow over an undirected capacitated network.
//!
//! Capacities are `f64`; infinite capacities are admitted on input and clamped
//! to one more than the sum of all finite capacities, which no finite cut can
//! exceed.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct Arc {
    to: u32,
    /// Index of the reverse arc in `arcs[to]`.
    rev: u32,
    /// Residual capacity.
    cap: f64,
}

pub struct FlowNetwork {
    arcs: Vec<Vec<Arc>>,
}

impl FlowNetwork {
    pub fn new(node_count: usize) -> Self {
        Self {
            arcs: vec![Vec::new(); node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.arcs.len()
    }

    /// Adds an undirected edge: both directions start with the full capacity.
    pub fn add_undirected_edge(&mut self, u: u32, v: u32, capacity: f64) {
        debug_assert!(capacity >= 0.0);
        let (u, v) = (u as usize, v as usize);
        let rev_u = self.arcs[v].len() as u32;
        let rev_v = self.arcs[u].len() as u32;
        self.arcs[u].push(Arc {
            to: v as u32,
            rev: rev_u,
            cap: capacity,
        });
        self.arcs[v].push(Arc {
            to: u as u32,
            rev: rev_v,
            cap: capacity,
        });
    }

    fn clamp_infinite_capacities(&mut self) {
        let finite_sum: f64 = self
            .arcs
            .iter()
            .flatten()
            .map(|a| if a.cap.is_finite() { a.cap } else { 0.0 })
            .sum();
        let clamp = finite_sum + 1.0;
        for arcs in &mut self.arcs {
            for arc in arcs {
                if !arc.cap.is_finite() {
                    arc.cap = clamp;
                }
            }
        }
    }

    /// Computes the maximum `source` → `sink` flow and leaves residual capacities
    /// behind for [`FlowNetwork::source_side`].
    pub fn max_flow(&mut self, source: u32, sink: u32) -> f64 {
        assert_ne!(source, sink);
        let n = self.node_count();
        self.clamp_infinite_capacities();

        let mut height = vec![0u32; n];
        let mut excess = vec![0f64; n];
        let mut current = vec![0usize; n];
        let mut active = VecDeque::new();
        height[source as usize] = n as u32;

        // Saturate every arc out of the source.
        for i in 0..self.arcs[source as usize].len() {
            let arc = self.arcs[source as usize][i];
            if arc.cap > 0.0 {
                self.arcs[source as usize][i].cap = 0.0;
                self.arcs[arc.to as usize][arc.rev as usize].cap += arc.cap;
                let was_inactive = excess[arc.to as usize] == 0.0;
                excess[arc.to as usize] += arc.cap;
                if was_inactive && arc.to != sink && arc.to != source {
                    active.push_back(arc.to);
                }
            }
        }

        while let Some(u) = active.pop_front() {
            let ui = u as usize;
            while excess[ui] > 0.0 {
                if current[ui] == self.arcs[ui].len() {
                    // Relabel: one above the lowest residual neighbor.
                    let min_height = self.arcs[ui]
                        .iter()
                        .filter(|a| a.cap > 0.0)
                        .map(|a| height[a.to as usize])
                        .min();
                    match min_height {
                        Some(h) => height[ui] = h + 1,
                        None => break, // No residual arcs at all; excess is stranded.
                    }
                    current[ui] = 0;
                    continue;
                }
                let arc = self.arcs[ui][current[ui]];
                if arc.cap > 0.0 && height[ui] == height[arc.to as usize] + 1 {
                    let amount = excess[ui].min(arc.cap);
                    self.arcs[ui][current[ui]].cap -= amount;
                    self.arcs[arc.to as usize][arc.rev as usize].cap += amount;
                    excess[ui] -= amount;
                    let was_inactive = excess[arc.to as usize] == 0.0;
                    excess[arc.to as usize] += amount;
                    if was_inactive && arc.to != source && arc.to != sink {
                        active.push_back(arc.to);
                    }
                } else {
                    current[ui] += 1;
                }
            }
        }

        excess[sink as usize]
    }

    /// The source side of the minimum cut: every node reachable from `source`
    /// through arcs with residual capacity. Only meaningful after
    /// [`FlowNetwork::max_flow`].
    pub fn source_side(&self, source: u32) -> Vec<bool> {
        let mut reached = vec![false; self.node_count()];
        let mut queue = VecDeque::from([source]);
        reached[source as usize] = true;
        while let Some(u) = queue.pop_front() {
            for arc in &self.arcs[u as usize] {
                if arc.cap > 0.0 && !reached[arc.to as usize] {
                    reached[arc.to as usize] = true;
                    queue.push_back(arc.to);
                }
            }
        }
        reached
    }
}
