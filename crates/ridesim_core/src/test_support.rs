//! Shared fixtures for tests and benches: tiny synthetic road networks
//! and problem instances with hand-checkable geometry.

use std::collections::HashMap;

use crate::config::SimConfig;
use crate::engine::Engine;
use crate::kernel::Kernel;
use crate::models::{ProblemSet, Trip};
use crate::roadnet::{DijkstraIndex, EdgeMap, RoadNet};
use crate::types::{DistInt, NodeId, Point, SimTime};

/// A straight line of `n` nodes (ids `0..n`) with every edge `weight`
/// meters. Coordinates step ~11 meters east per node so haversine
/// distances stay small and grid buckets stay meaningful.
pub fn line_network(n: usize, weight: DistInt) -> RoadNet {
    let mut nodes = HashMap::new();
    for i in 0..n {
        nodes.insert(
            i as NodeId,
            Point {
                lng: 13.0 + i as f64 * 1e-4,
                lat: 52.5,
            },
        );
    }
    let mut edges: EdgeMap = HashMap::new();
    for i in 0..n.saturating_sub(1) {
        let (a, b) = (i as NodeId, (i + 1) as NodeId);
        edges.entry(a).or_default().insert(b, weight);
        edges.entry(b).or_default().insert(a, weight);
    }
    let index = DijkstraIndex::build(&edges);
    RoadNet::new(nodes, edges, Box::new(index))
}

/// Kernel handle over a network at a given speed and tick.
pub fn kernel_on(net: &RoadNet, speed: DistInt, now: SimTime) -> Kernel<'_> {
    Kernel::new(net, speed, now)
}

/// One vehicle (id 1, three seats, 0 -> 3) and one customer
/// (id 7, 1 -> 2, deadline 4) on the four-node line.
pub fn line_problem() -> ProblemSet {
    let mut set = ProblemSet {
        name: "tiny".into(),
        road_network: "line4".into(),
        ..ProblemSet::default()
    };
    set.push(Trip {
        id: 1,
        orig: 0,
        dest: 3,
        early: 0,
        late: 60,
        load: -3,
    });
    set.push(Trip {
        id: 7,
        orig: 1,
        dest: 2,
        early: 0,
        late: 4,
        load: 1,
    });
    set
}

/// Engine over [`line_network`]\(4, 10) and [`line_problem`], speed 10.
pub fn line_engine() -> Engine {
    Engine::new(
        line_network(4, 10),
        line_problem(),
        SimConfig::default().with_speed(10),
        None,
    )
}
