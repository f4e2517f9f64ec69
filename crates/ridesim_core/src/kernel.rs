//! Pure schedule and route operations.
//!
//! Everything here computes over value snapshots; the only shared input is
//! the read-only road network carried by [`Kernel`] together with the
//! current tick and vehicle speed. Strategies and the simulator both build
//! a fresh handle per use, so there is no hidden clock state.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::{Customer, Vehicle};
use crate::roadnet::RoadNet;
use crate::types::{DistInt, SimTime, Stop, StopKind, TripId, Waypoint, NO_DEADLINE};

/// Result of a schedule-insertion search: the cheapest augmented schedule,
/// the route that serves it, and its cost.
#[derive(Debug, Clone)]
pub struct Insertion {
    pub cost: DistInt,
    pub schedule: Vec<Stop>,
    pub route: Vec<Waypoint>,
}

/// Borrowed context for the route-building operations.
#[derive(Clone, Copy)]
pub struct Kernel<'a> {
    pub net: &'a RoadNet,
    pub speed: DistInt,
    pub now: SimTime,
}

impl<'a> Kernel<'a> {
    pub fn new(net: &'a RoadNet, speed: DistInt, now: SimTime) -> Self {
        Self { net, speed, now }
    }

    /// Build the waypoint sequence visiting a schedule in order.
    ///
    /// The route starts at distance 0 on the first stop's location. Two
    /// consecutive stops at the same location produce a zero-length repeat
    /// waypoint, which is what lets the motion loop observe a stop sitting
    /// exactly on the node a vehicle is approaching. Returns the route and
    /// its total cost (the last waypoint's cumulative distance).
    pub fn route_through(&self, sch: &[Stop]) -> (Vec<Waypoint>, DistInt) {
        assert!(!sch.is_empty(), "route_through on an empty schedule");
        let mut cost: DistInt = 0;
        let mut route = vec![Waypoint::new(0, sch[0].loc)];
        for pair in sch.windows(2) {
            let (from, to) = (pair[0].loc, pair[1].loc);
            if from == to {
                route.push(Waypoint::new(cost, to));
                continue;
            }
            let seg = self.net.shortest_path(from, to);
            for k in 1..seg.len() {
                cost += self.net.edge_weight(seg[k - 1], seg[k]);
                route.push(Waypoint::new(cost, seg[k]));
            }
        }
        (route, cost)
    }

    /// Check that every stop can be reached before its deadline when the
    /// vehicle follows `route` at the kernel's speed starting now.
    pub fn check_time_windows(&self, sch: &[Stop], route: &[Waypoint]) -> bool {
        assert!(self.speed > 0, "vehicle speed must be positive");
        let (Some(first), Some(final_wp)) = (route.first(), route.last()) else {
            return false;
        };
        let Some(last) = sch.last() else {
            return false;
        };
        let head = first.dist;
        let now = self.now as f64;
        let speed = self.speed as f64;
        let arrival = (final_wp.dist - head) as f64 / speed + now;
        if last.late != NO_DEADLINE && (last.late as f64) < arrival {
            return false;
        }

        // Walk schedule and route jointly; each stop matches the first
        // waypoint at its location at or after the previous match.
        let mut j = 0;
        for stop in sch {
            while route[j].node != stop.loc {
                j += 1;
                if j == route.len() {
                    panic!(
                        "route ended before schedule: stop at node {} never appears",
                        stop.loc
                    );
                }
            }
            let eta = (route[j].dist - head) as f64 / speed + now;
            if stop.late != NO_DEADLINE && (stop.late as f64) < eta {
                return false;
            }
        }
        true
    }

    /// Cheapest insertion of an origin/destination stop pair into a
    /// schedule, preserving origin-before-destination and the fixed
    /// endpoints.
    ///
    /// Candidates are enumerated with a serpentine sweep: the origin slot
    /// moves left to right through the free region, and for each origin
    /// slot the destination sweeps the remaining slots, alternating
    /// direction row by row. Every order-preserving insertion is visited
    /// exactly once; an equal-cost candidate found later replaces the
    /// incumbent.
    pub fn insert_stops(
        &self,
        sch: &[Stop],
        orig: Stop,
        dest: Stop,
        fix_start: bool,
        fix_end: bool,
    ) -> Insertion {
        let fs = fix_start as usize;
        let fe = fix_end as usize;
        assert!(
            sch.len() >= fs + fe,
            "schedule too short for its fixed endpoints"
        );
        // Insertion slots in the free region: positions fs ..= len - fe.
        let slots = sch.len() + 1 - fs - fe;
        let mut best: Option<Insertion> = None;
        let mut cand: Vec<Stop> = Vec::with_capacity(sch.len() + 2);

        for (row, o) in (0..slots).enumerate() {
            let sweep: Vec<usize> = if row % 2 == 0 {
                (o..slots).collect()
            } else {
                (o..slots).rev().collect()
            };
            for d in sweep {
                cand.clear();
                cand.extend_from_slice(&sch[..fs + o]);
                cand.push(orig);
                cand.extend_from_slice(&sch[fs + o..fs + d]);
                cand.push(dest);
                cand.extend_from_slice(&sch[fs + d..]);

                let (route, cost) = self.route_through(&cand);
                if best.as_ref().map_or(true, |b| cost <= b.cost) {
                    best = Some(Insertion {
                        cost,
                        schedule: cand.clone(),
                        route,
                    });
                }
            }
        }
        best.expect("insertion search produced no candidate")
    }

    /// Insert a customer into a vehicle's schedule.
    ///
    /// The vehicle's schedule starts at its next node, so the raw route
    /// from [`Self::route_through`] is relative to that stop; the distance
    /// already accumulated to the next node (`route[lvn + 1].dist`) is
    /// added back onto every waypoint and onto the returned cost. For a
    /// taxi the synthetic destination is unpinned during the search and
    /// re-anchored on the last real stop afterwards.
    pub fn insert_customer(&self, vehl: &Vehicle, cust: &Customer) -> Insertion {
        let head = vehl.route[vehl.lvn + 1].dist;
        let orig = Stop::new(cust.id, cust.orig, StopKind::CustOrig, cust.early, cust.late);
        let dest = Stop::new(cust.id, cust.dest, StopKind::CustDest, cust.early, cust.late);

        let mut ins = if vehl.is_taxi() {
            let mut base = vehl.schedule.clone();
            base.truncate(base.len() - 1); // unpin the synthetic destination
            let mut ins = self.insert_stops(&base, orig, dest, true, false);
            let anchor = ins.schedule[ins.schedule.len() - 1];
            ins.schedule.push(Stop::new(
                vehl.id,
                anchor.loc,
                StopKind::VehlDest,
                anchor.early,
                NO_DEADLINE,
            ));
            ins
        } else {
            self.insert_stops(&vehl.schedule, orig, dest, true, true)
        };

        for wp in &mut ins.route {
            wp.dist += head;
        }
        ins.cost += head;
        assert!(ins.cost >= head, "negative detour in insertion");
        ins
    }

    /// Remove `remove` from the vehicle's schedule, then insert `cust`.
    pub fn replace_customer(&self, vehl: &Vehicle, remove: TripId, cust: &Customer) -> Insertion {
        let mut copy = vehl.clone();
        remove_customer(&mut copy.schedule, remove);
        self.insert_customer(&copy, cust)
    }

    /// Slack distance within which the customer can still be picked up and
    /// delivered by its deadline.
    pub fn pickup_range(&self, cust: &Customer) -> DistInt {
        let base = self.net.path_cost(cust.orig, cust.dest);
        self.speed * cust.late - base - self.speed * self.now
    }
}

/// Verify the structural invariants of a schedule owned by `owner`:
/// the last stop is the owner's `VehlDest`; a leading `VehlOrig` belongs
/// to the owner; no interior `VehlOrig`; every origin precedes its paired
/// destination; every non-destination stop is paired. The nested pair
/// scan is O(n^2), which is fine at schedule sizes.
pub fn check_precedence(owner: TripId, sch: &[Stop]) -> bool {
    let Some(last) = sch.last() else {
        return false;
    };
    if last.kind != StopKind::VehlDest || last.owner != owner {
        return false;
    }
    if sch[0].kind == StopKind::VehlOrig && sch[0].owner != owner {
        return false;
    }
    // The stop before the destination can never be an origin-with-nothing-
    // after-it; its pair would have to follow the vehicle destination.
    if sch.len() > 2 {
        let penultimate = sch[sch.len() - 2].kind;
        if penultimate == StopKind::CustOrig || penultimate == StopKind::VehlOrig {
            return false;
        }
    }

    use StopKind::*;
    for (i, a) in sch.iter().enumerate() {
        if i > 0 && a.kind == VehlOrig {
            return false;
        }
        let mut paired = false;
        for (j, b) in sch.iter().enumerate() {
            if i == j || a.owner != b.owner {
                continue;
            }
            match (a.kind, b.kind) {
                (CustOrig, CustDest) if i < j => paired = true,
                (CustOrig, CustDest) => return false,
                (CustDest, CustOrig) if i > j => paired = true,
                (CustDest, CustOrig) => return false,
                (VehlOrig, VehlDest) if i < j => paired = true,
                (VehlOrig, VehlDest) => return false,
                (VehlDest, VehlOrig) if i > j => paired = true,
                (VehlDest, VehlOrig) => return false,
                _ => {}
            }
            if paired {
                break;
            }
        }
        if !paired && a.kind != CustDest && a.kind != VehlDest {
            return false;
        }
    }
    true
}

/// Simulate seat occupancy over a schedule. `capacity` is the number of
/// seats currently free; each `CustOrig` takes one and each `CustDest`
/// releases one. False when any prefix would overdraw.
pub fn check_capacity(capacity: i32, sch: &[Stop]) -> bool {
    let mut free = capacity;
    for stop in sch {
        match stop.kind {
            StopKind::CustOrig => free -= 1,
            StopKind::CustDest => free += 1,
            _ => {}
        }
        if free < 0 {
            return false;
        }
    }
    true
}

/// Remove both stops owned by `cust_id` from a schedule. When the removed
/// customer was the last visit before a taxi's synthetic destination, the
/// destination is re-anchored onto the new last real stop. Panics if the
/// customer does not have exactly two stops present (corrupt schedule).
pub fn remove_customer(sch: &mut Vec<Stop>, cust_id: TripId) {
    let was_last = sch.len() > 2 && sch[sch.len() - 2].owner == cust_id;
    let is_taxi = sch[sch.len() - 1].late == NO_DEADLINE;

    let before = sch.len();
    sch.retain(|s| s.owner != cust_id);
    assert_eq!(
        before - sch.len(),
        2,
        "customer {cust_id} does not own exactly two stops in the schedule"
    );

    if was_last && is_taxi {
        let vehl = sch[0].owner;
        let anchor = sch[sch.len() - 2];
        let end = sch.len() - 1;
        sch[end] = Stop::new(vehl, anchor.loc, StopKind::VehlDest, anchor.early, NO_DEADLINE);
    }
}

/// A uniformly random customer that still has both stops in the schedule,
/// or `None` when every remaining stop belongs to the vehicle.
pub fn random_customer<R: Rng>(rng: &mut R, sch: &[Stop]) -> Option<TripId> {
    let mut shuffled: Vec<Stop> = sch.to_vec();
    shuffled.shuffle(rng);
    for (i, a) in shuffled.iter().enumerate() {
        if a.kind == StopKind::VehlOrig || a.kind == StopKind::VehlDest {
            continue;
        }
        if shuffled[i + 1..].iter().any(|b| b.owner == a.owner) {
            return Some(a.owner);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{kernel_on, line_network};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn stop(owner: TripId, loc: i64, kind: StopKind) -> Stop {
        Stop::new(owner, loc, kind, 0, 100)
    }

    // Vehicle 9 schedule heading 0 -> 3 on the line network.
    fn vehl_sched() -> Vec<Stop> {
        vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(9, 3, StopKind::VehlDest),
        ]
    }

    #[test]
    fn route_through_accumulates_edge_weights() {
        let net = line_network(4, 10);
        let k = kernel_on(&net, 10, 0);
        let (route, cost) = k.route_through(&vehl_sched());
        assert_eq!(cost, 30);
        assert_eq!(
            route,
            vec![
                Waypoint::new(0, 0),
                Waypoint::new(10, 1),
                Waypoint::new(20, 2),
                Waypoint::new(30, 3),
            ]
        );
    }

    #[test]
    fn route_through_repeats_shared_locations_at_zero_length() {
        let net = line_network(4, 10);
        let k = kernel_on(&net, 10, 0);
        let sch = vec![
            stop(9, 1, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        let (route, cost) = k.route_through(&sch);
        assert_eq!(cost, 20);
        assert_eq!(route[0], Waypoint::new(0, 1));
        assert_eq!(route[1], Waypoint::new(0, 1));
        assert_eq!(route[2], Waypoint::new(10, 2));
    }

    #[test]
    fn precedence_accepts_a_well_formed_schedule() {
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(check_precedence(9, &sch));
    }

    #[test]
    fn precedence_rejects_structural_violations() {
        // Destination before origin.
        let flipped = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 2, StopKind::CustDest),
            stop(7, 1, StopKind::CustOrig),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(!check_precedence(9, &flipped));

        // Unpaired origin.
        let unpaired = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(!check_precedence(9, &unpaired));

        // Interior vehicle origin.
        let interior = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(9, 1, StopKind::VehlOrig),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(!check_precedence(9, &interior));

        // Wrong owner on the tail.
        let tail = vec![stop(9, 0, StopKind::VehlOrig), stop(8, 3, StopKind::VehlDest)];
        assert!(!check_precedence(9, &tail));

        // A lone destination for an onboard customer is legal.
        let onboard = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 2, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(check_precedence(9, &onboard));
    }

    #[test]
    fn capacity_simulation_tracks_prefix_load() {
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(8, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            stop(8, 2, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(check_capacity(2, &sch));
        assert!(!check_capacity(1, &sch));

        // A dropoff frees the seat for a later pickup.
        let chained = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            stop(8, 2, StopKind::CustOrig),
            stop(8, 3, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert!(check_capacity(1, &chained));
    }

    #[test]
    fn time_window_check_honors_deadlines_and_sentinels() {
        let net = line_network(4, 10);
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            Stop::new(7, 1, StopKind::CustOrig, 0, 1),
            Stop::new(7, 2, StopKind::CustDest, 0, 2),
            Stop::new(9, 3, StopKind::VehlDest, 0, NO_DEADLINE),
        ];
        let k = kernel_on(&net, 10, 0);
        let (route, _) = k.route_through(&sch);
        assert!(k.check_time_windows(&sch, &route));

        // One tick later the first pickup deadline is missed.
        let late = kernel_on(&net, 10, 1);
        assert!(!late.check_time_windows(&sch, &route));

        // An unbounded tail never fails on its own.
        let tail_only = vec![
            stop(9, 0, StopKind::VehlOrig),
            Stop::new(9, 3, StopKind::VehlDest, 0, NO_DEADLINE),
        ];
        let (tail_route, _) = k.route_through(&tail_only);
        let far_future = kernel_on(&net, 10, 1_000);
        assert!(far_future.check_time_windows(&tail_only, &tail_route));
    }

    #[test]
    fn serpentine_visits_every_ordering_and_keeps_the_cheapest() {
        // Five stops, both endpoints fixed: three free stops, four slots,
        // C(5, 2) = 10 order-preserving insertions.
        let net = line_network(6, 10);
        let k = kernel_on(&net, 10, 0);
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(5, 1, StopKind::CustOrig),
            stop(5, 4, StopKind::CustDest),
            stop(6, 4, StopKind::CustDest),
            stop(9, 5, StopKind::VehlDest),
        ];
        let orig = stop(7, 2, StopKind::CustOrig);
        let dest = stop(7, 3, StopKind::CustDest);

        // Count candidates by running the same sweep shape.
        let slots = sch.len() + 1 - 2;
        let expected: usize = (0..slots).map(|o| slots - o).sum();
        assert_eq!(expected, 10);

        let ins = k.insert_stops(&sch, orig, dest, true, true);
        assert!(check_precedence(9, &ins.schedule));
        assert_eq!(ins.schedule.len(), 7);

        // The cheapest placement slots the pair between the existing
        // origin and the destinations: 0..1..2..3..4..5 with no detour.
        assert_eq!(ins.cost, 50);
        let locs: Vec<i64> = ins.schedule.iter().map(|s| s.loc).collect();
        assert_eq!(locs, vec![0, 1, 2, 3, 4, 4, 5]);
    }

    #[test]
    fn insert_stops_with_no_free_region_produces_the_single_candidate() {
        let net = line_network(4, 10);
        let k = kernel_on(&net, 10, 0);
        let ins = k.insert_stops(
            &vehl_sched(),
            stop(7, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            true,
            true,
        );
        let locs: Vec<i64> = ins.schedule.iter().map(|s| s.loc).collect();
        assert_eq!(locs, vec![0, 1, 2, 3]);
        assert_eq!(ins.cost, 30);
    }

    #[test]
    fn insert_then_remove_restores_the_schedule() {
        let net = line_network(6, 10);
        let k = kernel_on(&net, 10, 0);
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(5, 1, StopKind::CustOrig),
            stop(5, 4, StopKind::CustDest),
            stop(9, 5, StopKind::VehlDest),
        ];
        let ins = k.insert_stops(
            &sch,
            stop(7, 2, StopKind::CustOrig),
            stop(7, 3, StopKind::CustDest),
            true,
            true,
        );
        let mut out = ins.schedule;
        remove_customer(&mut out, 7);
        assert_eq!(out, sch);
    }

    #[test]
    fn remove_customer_reanchors_a_taxi_destination() {
        let mut sch = vec![
            Stop::new(9, 0, StopKind::VehlOrig, 0, NO_DEADLINE),
            Stop::new(7, 1, StopKind::CustOrig, 0, 100),
            Stop::new(7, 2, StopKind::CustDest, 0, 100),
            Stop::new(9, 2, StopKind::VehlDest, 0, NO_DEADLINE),
        ];
        remove_customer(&mut sch, 7);
        assert_eq!(sch.len(), 2);
        let tail = sch[1];
        assert_eq!(tail.kind, StopKind::VehlDest);
        assert_eq!(tail.owner, 9);
        // Re-anchored on the only remaining stop: the synthetic origin.
        assert_eq!(tail.loc, 0);
        assert_eq!(tail.late, NO_DEADLINE);
    }

    #[test]
    fn random_customer_finds_only_fully_paired_customers() {
        let mut rng = StdRng::seed_from_u64(7);
        let sch = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(7, 1, StopKind::CustOrig),
            stop(7, 2, StopKind::CustDest),
            stop(8, 2, StopKind::CustDest), // onboard: origin already visited
            stop(9, 3, StopKind::VehlDest),
        ];
        for _ in 0..32 {
            assert_eq!(random_customer(&mut rng, &sch), Some(7));
        }

        let none = vec![
            stop(9, 0, StopKind::VehlOrig),
            stop(8, 2, StopKind::CustDest),
            stop(9, 3, StopKind::VehlDest),
        ];
        assert_eq!(random_customer(&mut rng, &none), None);
    }

    #[test]
    fn pickup_range_shrinks_with_time() {
        let net = line_network(4, 10);
        let cust = Customer {
            id: 7,
            orig: 1,
            dest: 2,
            early: 0,
            late: 4,
            load: 1,
            status: crate::types::CustStatus::Waiting,
            assigned_to: None,
        };
        let at_zero = kernel_on(&net, 10, 0).pickup_range(&cust);
        let at_two = kernel_on(&net, 10, 2).pickup_range(&cust);
        assert_eq!(at_zero, 10 * 4 - 10);
        assert_eq!(at_two, at_zero - 20);
    }
}
