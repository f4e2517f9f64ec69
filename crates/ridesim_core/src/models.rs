//! Value snapshots and problem-instance records.
//!
//! Strategies never hold references into the store; they receive these
//! owned snapshots and push every mutation back through the commit
//! protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    CustStatus, DistInt, NodeId, SimTime, Stop, TripId, VehlStatus, Waypoint, NO_DEADLINE, NO_NODE,
};

/// A vehicle is either a commuter with a fixed destination and deadline,
/// or a permanent taxi that is re-seeded with random destinations until
/// the request stream dries up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleKind {
    Commuter { dest: NodeId, late: SimTime },
    Taxi,
}

/// Snapshot of one vehicle row. `capacity` is the positive seat count;
/// `load` counts customers physically onboard and `queued` counts
/// customers assigned but not yet dropped off.
#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: TripId,
    pub orig: NodeId,
    pub kind: VehicleKind,
    pub early: SimTime,
    pub capacity: i32,
    pub load: i32,
    pub queued: i32,
    pub status: VehlStatus,
    pub route: Vec<Waypoint>,
    pub lvn: usize,
    pub nnd: DistInt,
    pub schedule: Vec<Stop>,
}

impl Vehicle {
    pub fn is_taxi(&self) -> bool {
        self.kind == VehicleKind::Taxi
    }

    /// Deadline of the vehicle window; `NO_DEADLINE` for taxis.
    pub fn late(&self) -> SimTime {
        match self.kind {
            VehicleKind::Commuter { late, .. } => late,
            VehicleKind::Taxi => NO_DEADLINE,
        }
    }

    /// Fixed destination; `NO_NODE` for taxis.
    pub fn dest(&self) -> NodeId {
        match self.kind {
            VehicleKind::Commuter { dest, .. } => dest,
            VehicleKind::Taxi => NO_NODE,
        }
    }

    /// The waypoint most recently crossed.
    pub fn last_visited_node(&self) -> NodeId {
        self.route[self.lvn].node
    }

    /// The node currently being approached.
    pub fn next_node(&self) -> NodeId {
        self.route[self.lvn + 1].node
    }

    pub fn seats_free(&self) -> i32 {
        self.capacity - self.load
    }
}

/// Snapshot of one customer row.
#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: TripId,
    pub orig: NodeId,
    pub dest: NodeId,
    pub early: SimTime,
    pub late: SimTime,
    pub load: i32,
    pub status: CustStatus,
    pub assigned_to: Option<TripId>,
}

impl Customer {
    pub fn assigned(&self) -> bool {
        self.assigned_to.is_some()
    }
}

/// One raw trip line from a problem instance. Negative `load` is a
/// vehicle with `-load` seats; positive `load` is a customer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub orig: NodeId,
    pub dest: NodeId,
    pub early: SimTime,
    pub late: SimTime,
    pub load: i32,
}

impl Trip {
    pub fn is_vehicle(&self) -> bool {
        self.load < 0
    }

    pub fn is_taxi(&self) -> bool {
        self.load < 0 && self.late == NO_DEADLINE && self.dest == NO_NODE
    }
}

/// A problem instance: trips grouped by the time they appear. The map is
/// ordered so the largest `early` (which anchors the minimum simulation
/// length) is cheap to find.
#[derive(Debug, Clone, Default)]
pub struct ProblemSet {
    pub name: String,
    pub road_network: String,
    pub trips: BTreeMap<SimTime, Vec<Trip>>,
}

impl ProblemSet {
    pub fn push(&mut self, trip: Trip) {
        self.trips.entry(trip.early).or_default().push(trip);
    }

    pub fn all_trips(&self) -> impl Iterator<Item = &Trip> {
        self.trips.values().flatten()
    }

    /// Appearance time of the last trip, or 0 for an empty instance.
    pub fn last_appearance(&self) -> SimTime {
        self.trips.keys().next_back().copied().unwrap_or(0)
    }

    /// Rewrite every trip to appear at t = 0, keeping deadlines.
    pub fn make_static(&mut self) {
        let mut all: Vec<Trip> = self.all_trips().copied().collect();
        for trip in &mut all {
            trip.early = 0;
        }
        self.trips.clear();
        for trip in all {
            self.push(trip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(id: TripId, early: SimTime, load: i32) -> Trip {
        Trip {
            id,
            orig: 1,
            dest: 2,
            early,
            late: early + 100,
            load,
        }
    }

    #[test]
    fn problem_set_groups_by_appearance_time() {
        let mut set = ProblemSet::default();
        set.push(trip(1, 5, 1));
        set.push(trip(2, 0, -3));
        set.push(trip(3, 5, 1));

        assert_eq!(set.trips[&5].len(), 2);
        assert_eq!(set.last_appearance(), 5);

        set.make_static();
        assert_eq!(set.last_appearance(), 0);
        assert_eq!(set.trips[&0].len(), 3);
    }

    #[test]
    fn taxi_detection_needs_both_sentinels() {
        let mut t = trip(1, 0, -1);
        assert!(!t.is_taxi());
        t.dest = NO_NODE;
        t.late = NO_DEADLINE;
        assert!(t.is_taxi());
        t.load = 1;
        assert!(!t.is_taxi());
    }
}
