//! The shared engine handle.
//!
//! One `Engine` owns the road network, the store, the clock and the run
//! counters; the simulator thread and the matching thread share it behind
//! an `Arc`. Clock and effective speed are atomics so the matching thread
//! can read them without touching the store lock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use crate::config::SimConfig;
use crate::kernel::Kernel;
use crate::matching::MatchStats;
use crate::models::{ProblemSet, VehicleKind};
use crate::report::{EventSender, LogEvent};
use crate::roadnet::RoadNet;
use crate::store::Store;
use crate::types::{DistInt, SimTime, Stop, StopKind, NO_DEADLINE};

pub struct Engine {
    net: RoadNet,
    store: Store,
    config: SimConfig,
    events: Option<EventSender>,
    clock: AtomicI64,
    speed: AtomicI64,
    done: AtomicBool,
    stats: MatchStats,
    tmin: SimTime,
    tmax: SimTime,
    base_cost: DistInt,
    total_vehicles: usize,
    total_customers: usize,
    problem_name: String,
    road_network: String,
}

impl Engine {
    /// Build the engine and seed the store from a problem instance:
    /// initial routes and schedules for every vehicle (taxis get a random
    /// first destination), base costs for every trip, and the stop table.
    pub fn new(
        net: RoadNet,
        mut problem: ProblemSet,
        config: SimConfig,
        events: Option<EventSender>,
    ) -> Self {
        if config.static_mode {
            problem.make_static();
        }
        let tmin = problem.last_appearance() + config.matching_period;
        let tmax = problem
            .all_trips()
            .map(|t| t.late)
            .filter(|&l| l != NO_DEADLINE)
            .max()
            .unwrap_or(0);

        let store = Store::new();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut base_cost: DistInt = 0;
        let mut total_vehicles = 0;
        let mut total_customers = 0;

        {
            let mut tables = store.begin();
            let kernel = Kernel::new(&net, config.vehicle_speed, 0);

            for trip in problem.all_trips() {
                if trip.load < 0 {
                    total_vehicles += 1;
                    let taxi = trip.is_taxi();
                    let dest = if taxi {
                        net.random_node_excluding(&mut rng, trip.orig)
                    } else {
                        trip.dest
                    };
                    let late = if taxi { NO_DEADLINE } else { trip.late };

                    let ends = [
                        Stop::new(trip.id, trip.orig, StopKind::VehlOrig, trip.early, late),
                        Stop::new(trip.id, dest, StopKind::VehlDest, trip.early, late),
                    ];
                    let (route, cost) = kernel.route_through(&ends);
                    base_cost += cost;
                    tables.set_base_cost(trip.id, cost);

                    let nnd = route[1].dist;
                    let schedule = vec![
                        Stop::new(trip.id, route[1].node, StopKind::VehlOrig, trip.early, late),
                        ends[1],
                    ];
                    let kind = if taxi {
                        VehicleKind::Taxi
                    } else {
                        VehicleKind::Commuter {
                            dest,
                            late: trip.late,
                        }
                    };
                    tables.insert_vehicle(
                        trip.id,
                        trip.orig,
                        kind,
                        trip.early,
                        -trip.load,
                        route,
                        nnd,
                        schedule,
                    );
                    tables.insert_stop_record(trip.id, trip.orig);
                    tables.insert_stop_record(trip.id, dest);
                } else if trip.load > 0 {
                    total_customers += 1;
                    let ends = [
                        Stop::new(trip.id, trip.orig, StopKind::CustOrig, trip.early, trip.late),
                        Stop::new(trip.id, trip.dest, StopKind::CustDest, trip.early, trip.late),
                    ];
                    let (_, cost) = kernel.route_through(&ends);
                    base_cost += cost;
                    tables.set_base_cost(trip.id, cost);
                    tables.insert_customer(
                        trip.id, trip.orig, trip.dest, trip.early, trip.late, trip.load,
                    );
                    tables.insert_stop_record(trip.id, trip.orig);
                    tables.insert_stop_record(trip.id, trip.dest);
                } else {
                    warn!(trip = trip.id, "trip has zero load, skipping");
                }
            }
        }

        Self {
            net,
            store,
            speed: AtomicI64::new(config.vehicle_speed),
            config,
            events,
            clock: AtomicI64::new(0),
            done: AtomicBool::new(false),
            stats: MatchStats::default(),
            tmin,
            tmax,
            base_cost,
            total_vehicles,
            total_customers,
            problem_name: problem.name.clone(),
            road_network: problem.road_network.clone(),
        }
    }

    pub fn net(&self) -> &RoadNet {
        &self.net
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn stats(&self) -> &MatchStats {
        &self.stats
    }

    /// Current simulation tick.
    pub fn now(&self) -> SimTime {
        self.clock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_now(&self, t: SimTime) {
        self.clock.store(t, Ordering::SeqCst);
    }

    /// Effective vehicle speed in meters per tick (boosted during the
    /// drain phase of non-full runs).
    pub fn speed(&self) -> DistInt {
        self.speed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_speed(&self, speed: DistInt) {
        self.speed.store(speed, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Signal the matching thread to stop after its current round.
    pub fn shutdown(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Kernel handle at the current tick and speed.
    pub fn kernel(&self) -> Kernel<'_> {
        Kernel::new(&self.net, self.speed(), self.now())
    }

    /// Minimum simulation length: appearance of the last trip plus the
    /// matching period.
    pub fn tmin(&self) -> SimTime {
        self.tmin
    }

    pub fn tmax(&self) -> SimTime {
        self.tmax
    }

    pub fn base_cost(&self) -> DistInt {
        self.base_cost
    }

    pub fn total_vehicles(&self) -> usize {
        self.total_vehicles
    }

    pub fn total_customers(&self) -> usize {
        self.total_customers
    }

    pub fn problem_name(&self) -> &str {
        &self.problem_name
    }

    pub fn road_network(&self) -> &str {
        &self.road_network
    }

    pub fn log(&self, event: LogEvent) {
        if let Some(tx) = &self.events {
            tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{line_problem, line_network};
    use crate::types::VehlStatus;

    #[test]
    fn initialization_builds_routes_schedules_and_costs() {
        let net = line_network(4, 10);
        let problem = line_problem();
        let engine = Engine::new(net, problem, SimConfig::default().with_speed(10), None);

        assert_eq!(engine.total_vehicles(), 1);
        assert_eq!(engine.total_customers(), 1);
        // Vehicle 0 -> 3 costs 30; customer 1 -> 2 costs 10.
        assert_eq!(engine.base_cost(), 40);
        assert_eq!(engine.tmin(), 60);

        let vehicles = engine.store().all_vehicles();
        let v = &vehicles[0];
        assert_eq!(v.status, VehlStatus::Enroute);
        assert_eq!(v.lvn, 0);
        assert_eq!(v.nnd, 10);
        assert_eq!(v.route.len(), 4);
        assert_eq!(v.schedule.len(), 2);
        // The schedule head mirrors the node being approached.
        assert_eq!(v.schedule[0].loc, v.route[1].node);
    }

    #[test]
    fn static_mode_pulls_every_trip_to_time_zero() {
        let net = line_network(4, 10);
        let mut problem = line_problem();
        problem.push(crate::models::Trip {
            id: 30,
            orig: 0,
            dest: 2,
            early: 40,
            late: 90,
            load: 1,
        });
        let mut config = SimConfig::default().with_speed(10);
        config.static_mode = true;
        let engine = Engine::new(net, problem, config, None);
        assert_eq!(engine.tmin(), 60);
        assert_eq!(engine.store().waiting_customers(0).len(), 2);
    }
}
