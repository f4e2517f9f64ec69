//! Scalar vocabulary and the small copy types shared by every subsystem.

use serde::{Deserialize, Serialize};

/// Road-network node identifier. `NO_NODE` marks "no destination".
pub type NodeId = i64;

/// Trip identifier; vehicles and customers share one id space.
pub type TripId = i64;

/// Integer distance in meters.
pub type DistInt = i64;

/// Simulation time in ticks; one tick is roughly one real second.
pub type SimTime = i64;

/// Destination sentinel for permanent taxis.
pub const NO_NODE: NodeId = -1;

/// Deadline sentinel: the stop or vehicle has an unbounded time horizon.
pub const NO_DEADLINE: SimTime = -1;

/// A longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lng: f64,
    pub lat: f64,
}

/// Axis-aligned bounding box of the road network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lower_left: Point,
    pub upper_right: Point,
}

/// One element of a route: a node together with the cumulative distance
/// from the route origin. The first waypoint of a route is always at
/// distance 0 relative to where the route was constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Waypoint {
    pub dist: DistInt,
    pub node: NodeId,
}

impl Waypoint {
    pub fn new(dist: DistInt, node: NodeId) -> Self {
        Self { dist, node }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopKind {
    VehlOrig,
    VehlDest,
    CustOrig,
    CustDest,
}

/// A scheduled visit. `late == NO_DEADLINE` means the stop has no deadline
/// (permanent-taxi horizon). Stops held inside schedules carry
/// `visited_at: None`; the store's stop table records the visit times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub owner: TripId,
    pub loc: NodeId,
    pub kind: StopKind,
    pub early: SimTime,
    pub late: SimTime,
    pub visited_at: Option<SimTime>,
}

impl Stop {
    pub fn new(owner: TripId, loc: NodeId, kind: StopKind, early: SimTime, late: SimTime) -> Self {
        Self {
            owner,
            loc,
            kind,
            early,
            late,
            visited_at: None,
        }
    }
}

/// Identity used when matching schedule stops across snapshots: two stops
/// are the same visit when owner, location and kind agree, regardless of
/// window or visit bookkeeping.
pub fn same_stop(a: &Stop, b: &Stop) -> bool {
    a.owner == b.owner && a.loc == b.loc && a.kind == b.kind
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehlStatus {
    Enroute,
    Arrived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustStatus {
    Waiting,
    Onboard,
    Arrived,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_stop_ignores_window_and_visit_fields() {
        let a = Stop::new(7, 42, StopKind::CustOrig, 0, 100);
        let mut b = a;
        b.early = 5;
        b.late = 50;
        b.visited_at = Some(9);
        assert!(same_stop(&a, &b));

        let mut c = a;
        c.kind = StopKind::CustDest;
        assert!(!same_stop(&a, &c));
    }
}
