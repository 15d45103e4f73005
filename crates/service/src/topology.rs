//! De Bruijn peer topology.
//!
//! The overlay arranges the relay ids [0, N) on a de Bruijn graph: relay `v`
//! borders the ids reachable by shifting `v` one bit in either direction,
//! with both values of the bit shifted in. Self-loops and ids outside the
//! overlay are dropped and the remainder deduplicated; that set is the peer
//! list every relay dials at startup.
//!
//! Shifting toward a neighbor in one direction is shifting back in the
//! other, so the edge set is symmetric and every id keeps at least one peer
//! for any overlay size.

use ahash::AHashMap;

use crate::bits;

/// The peer graph of a fixed overlay of `nodes` relays.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: usize,
    width: u32,
    edges: AHashMap<u64, Vec<u64>>,
}

impl Topology {
    /// Build the peer graph for `nodes` relays.
    ///
    /// # Test
    ///
    /// ```
    /// use trellis_service::topology::Topology;
    ///
    /// let topology = Topology::new(4);
    ///
    /// assert_eq!(topology.neighbors(0), &[1, 2]);
    /// assert_eq!(topology.neighbors(3), &[1, 2]);
    /// ```
    pub fn new(nodes: usize) -> Self {
        assert!(nodes >= 2, "an overlay needs at least two relays");

        let width = bits::id_width(nodes);
        let masks = bits::masks(width);
        let max = nodes as u64 - 1;

        let mut edges: AHashMap<u64, Vec<u64>> = AHashMap::with_capacity(nodes);
        for id in 0..=max {
            edges.insert(id, Vec::new());
        }

        let mut topology = Self {
            nodes,
            width,
            edges,
        };

        for id in 0..=max {
            let up = (id << 1) & masks.all;
            let down = (id >> 1) & masks.all;

            for next in [up, up | masks.last, down, down | masks.first] {
                if next != id && next <= max {
                    topology.link(id, next);
                }
            }
        }

        for neighbors in topology.edges.values_mut() {
            neighbors.sort_unstable();
        }

        topology
    }

    fn link(&mut self, a: u64, b: u64) {
        let forward = self.edges.get_mut(&a).expect("id in range");
        if !forward.contains(&b) {
            forward.push(b);
        }

        let backward = self.edges.get_mut(&b).expect("id in range");
        if !backward.contains(&a) {
            backward.push(a);
        }
    }

    /// Peer ids of `id`, sorted ascending.
    pub fn neighbors(&self, id: u64) -> &[u64] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn width(&self) -> u32 {
        self.width
    }
}
