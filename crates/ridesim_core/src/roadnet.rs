//! Road network: node/edge lookup and shortest-path queries.
//!
//! Shortest paths come from a pluggable [`PathIndex`] backend behind a
//! mutex-guarded LRU cache of path segments. Two backends ship here:
//!
//! - **`DijkstraIndex`**: built directly from the edge set, always available.
//! - **`PrecomputedPathIndex`**: a path table loaded from a bincode file,
//!   for runs where the segments were computed offline by a hierarchical
//!   index.
//!
//! Invalid node ids are programmer errors and panic; the simulation cannot
//! continue on a corrupt graph.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use pathfinding::prelude::dijkstra;
use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, DistInt, NodeId, Point};

/// Default capacity of the path-segment cache.
pub const DEFAULT_SP_CACHE_CAPACITY: usize = 1_000_000;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in meters.
pub fn haversine(a: Point, b: Point) -> f64 {
    let (lat1, lng1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lng2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlng = (dlng * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlng * sin_dlng;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Shortest-path backend. Implementations must be `Send + Sync`; the
/// network is queried from both the simulator and the matching thread.
pub trait PathIndex: Send + Sync {
    /// Node sequence from `from` to `to`, inclusive of both endpoints.
    /// `None` when either id is unknown or no route exists.
    fn find_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>>;
}

/// Undirected adjacency map, both directions present.
pub type EdgeMap = HashMap<NodeId, HashMap<NodeId, DistInt>>;

/// Dijkstra over the raw edge set. Adequate for tests and small networks;
/// production runs load a precomputed table instead.
pub struct DijkstraIndex {
    adjacency: HashMap<NodeId, Vec<(NodeId, DistInt)>>,
}

impl DijkstraIndex {
    pub fn build(edges: &EdgeMap) -> Self {
        let mut adjacency: HashMap<NodeId, Vec<(NodeId, DistInt)>> = HashMap::new();
        for (&from, nbrs) in edges {
            let list = adjacency.entry(from).or_default();
            for (&to, &w) in nbrs {
                list.push((to, w));
            }
            // Deterministic expansion order regardless of hash seeds.
            list.sort_unstable();
        }
        Self { adjacency }
    }
}

impl PathIndex for DijkstraIndex {
    fn find_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![from]);
        }
        let (path, _cost) = dijkstra(
            &from,
            |n| {
                self.adjacency
                    .get(n)
                    .map(|v| v.clone())
                    .unwrap_or_default()
            },
            |n| *n == to,
        )?;
        Some(path)
    }
}

/// Path table computed offline and serialized with bincode. Keys are
/// directional `(from, to)` pairs; the reverse direction is answered by
/// reversing the stored sequence.
#[derive(Serialize, Deserialize)]
pub struct PrecomputedPathIndex {
    table: HashMap<(NodeId, NodeId), Vec<NodeId>>,
}

impl PrecomputedPathIndex {
    pub fn from_table(table: HashMap<(NodeId, NodeId), Vec<NodeId>>) -> Self {
        Self { table }
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let data = std::fs::read(path)?;
        let table: HashMap<(NodeId, NodeId), Vec<NodeId>> = bincode::deserialize(&data)?;
        Ok(Self { table })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let data = bincode::serialize(&self.table)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

impl PathIndex for PrecomputedPathIndex {
    fn find_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![from]);
        }
        if let Some(seq) = self.table.get(&(from, to)) {
            return Some(seq.clone());
        }
        self.table.get(&(to, from)).map(|seq| {
            let mut rev = seq.clone();
            rev.reverse();
            rev
        })
    }
}

/// The road network handle shared by every subsystem.
pub struct RoadNet {
    nodes: HashMap<NodeId, Point>,
    node_ids: Vec<NodeId>,
    edges: EdgeMap,
    bbox: BoundingBox,
    index: Box<dyn PathIndex>,
    cache: Mutex<LruCache<(NodeId, NodeId), Vec<NodeId>>>,
}

impl RoadNet {
    pub fn new(nodes: HashMap<NodeId, Point>, edges: EdgeMap, index: Box<dyn PathIndex>) -> Self {
        Self::with_cache_capacity(nodes, edges, index, DEFAULT_SP_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        nodes: HashMap<NodeId, Point>,
        edges: EdgeMap,
        index: Box<dyn PathIndex>,
        cache_capacity: usize,
    ) -> Self {
        assert!(!nodes.is_empty(), "road network has no nodes");
        let mut node_ids: Vec<NodeId> = nodes.keys().copied().collect();
        node_ids.sort_unstable();
        let bbox = bounding_box(&nodes);
        let capacity =
            NonZeroUsize::new(cache_capacity.max(1)).expect("cache capacity must be non-zero");
        Self {
            nodes,
            node_ids,
            edges,
            bbox,
            index,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node ids in ascending order, for deterministic sampling.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    /// Coordinates of a node. Panics on an unknown id.
    pub fn node(&self, id: NodeId) -> Point {
        match self.nodes.get(&id) {
            Some(p) => *p,
            None => panic!("unknown node id {id}"),
        }
    }

    /// Weight of the edge between two adjacent nodes; 0 when `a == b`.
    /// Panics when the nodes are not adjacent.
    pub fn edge_weight(&self, a: NodeId, b: NodeId) -> DistInt {
        if a == b {
            return 0;
        }
        match self.edges.get(&a).and_then(|m| m.get(&b)) {
            Some(w) => *w,
            None => panic!("no edge between nodes {a} and {b}"),
        }
    }

    /// Shortest path between two nodes, endpoints inclusive. Served from
    /// the segment cache when possible; misses call through to the backend
    /// and populate the cache. Panics when no path exists (invalid ids or
    /// a disconnected graph are programmer errors).
    pub fn shortest_path(&self, from: NodeId, to: NodeId) -> Vec<NodeId> {
        let key = (from, to);
        {
            let mut cache = self.cache.lock().expect("path cache poisoned");
            if let Some(seg) = cache.get(&key) {
                return seg.clone();
            }
        }
        let seg = match self.index.find_path(from, to) {
            Some(seg) => seg,
            None => panic!("no path between nodes {from} and {to}"),
        };
        let mut cache = self.cache.lock().expect("path cache poisoned");
        cache.put(key, seg.clone());
        seg
    }

    /// Network distance of the shortest path between two nodes.
    pub fn path_cost(&self, from: NodeId, to: NodeId) -> DistInt {
        let seg = self.shortest_path(from, to);
        seg.windows(2).map(|w| self.edge_weight(w[0], w[1])).sum()
    }

    /// A uniformly random node other than `exclude` (unless the network
    /// has a single node).
    pub fn random_node_excluding<R: rand::Rng>(&self, rng: &mut R, exclude: NodeId) -> NodeId {
        if self.node_ids.len() == 1 {
            return self.node_ids[0];
        }
        loop {
            let id = self.node_ids[rng.gen_range(0..self.node_ids.len())];
            if id != exclude {
                return id;
            }
        }
    }
}

fn bounding_box(nodes: &HashMap<NodeId, Point>) -> BoundingBox {
    let mut lower = Point {
        lng: f64::INFINITY,
        lat: f64::INFINITY,
    };
    let mut upper = Point {
        lng: f64::NEG_INFINITY,
        lat: f64::NEG_INFINITY,
    };
    for p in nodes.values() {
        lower.lng = lower.lng.min(p.lng);
        lower.lat = lower.lat.min(p.lat);
        upper.lng = upper.lng.max(p.lng);
        upper.lat = upper.lat.max(p.lat);
    }
    BoundingBox {
        lower_left: lower,
        upper_right: upper,
    }
}
