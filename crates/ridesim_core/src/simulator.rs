//! The tick loop and vehicle motion.
//!
//! Each tick runs entirely under the store lock: a bulk next-node-distance
//! decrement, then fine per-vehicle motion for every vehicle that crossed
//! a node, handling stop visits (pickups, dropoffs, arrivals, taxi
//! respawns) and rewriting the schedule head. The real-time loop paces
//! ticks at `round(1000 / time_multiplier)` milliseconds and warns when a
//! tick overruns its interval.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::kernel::Kernel;
use crate::report::LogEvent;
use crate::types::{DistInt, SimTime, Stop, StopKind, VehlStatus, NO_DEADLINE};

/// Effective speed during the drain phase of non-full runs: large enough
/// that every remaining vehicle finishes in one tick.
const DRAIN_SPEED: DistInt = 1_000_000_000;

pub struct Simulator {
    engine: Arc<Engine>,
    rng: StdRng,
    active: usize,
    drain_boosted: bool,
}

impl Simulator {
    pub fn new(engine: Arc<Engine>) -> Self {
        let active = engine.total_vehicles();
        let seed = engine.config().seed;
        Self {
            engine,
            // Offset from the init RNG so taxi respawns do not replay the
            // seeding sequence.
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            active,
            drain_boosted: false,
        }
    }

    pub fn active_vehicles(&self) -> usize {
        self.active
    }

    /// The run is over once every vehicle has arrived and the minimum
    /// simulation length has elapsed.
    pub fn finished(&self) -> bool {
        self.active == 0 && self.engine.now() > self.engine.tmin()
    }

    /// The real-time loop: ticks paced by the configured interval until
    /// completion, then the shutdown signal for the matching thread.
    pub fn run(&mut self) {
        let interval = self.engine.config().sleep_interval();
        info!(
            tmin = self.engine.tmin(),
            vehicles = self.active,
            "simulation started"
        );
        while !self.finished() {
            let t0 = Instant::now();
            self.tick();
            let elapsed = t0.elapsed();
            if elapsed > interval {
                warn!(
                    t = self.engine.now(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "tick exceeded its interval"
                );
            } else {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.engine.shutdown();
        info!(t = self.engine.now(), "simulation finished");
    }

    /// One tick: cancel elapsed customers, advance vehicles, bump the
    /// clock.
    pub fn tick(&mut self) {
        let t = self.engine.now();

        if !self.engine.config().full_sim && t > self.engine.tmin() && !self.drain_boosted {
            debug!(t, "drain phase, boosting speed");
            self.engine.set_speed(DRAIN_SPEED);
            self.drain_boosted = true;
        }

        let matching_period = self.engine.config().matching_period;
        let canceled = self
            .engine
            .store()
            .begin()
            .timeout_waiting(t, matching_period);
        for &cust in &canceled {
            self.engine.log(LogEvent::Timeout { t, cust });
        }
        if !canceled.is_empty() {
            debug!(t, count = canceled.len(), "timed out customers");
        }

        let (stepped, deactivated) = self.step(t);
        self.active -= deactivated;
        debug!(
            t,
            stepped,
            remaining = self.active,
            "stepped vehicles"
        );

        self.engine.set_now(t + 1);
    }

    /// Advance every active vehicle by one tick's distance, under the
    /// store lock for the whole pass. Returns (stepped, deactivated).
    fn step(&mut self, t: SimTime) -> (usize, usize) {
        let speed = self.engine.speed();
        let tmin = self.engine.tmin();
        let mut nstepped = 0;
        let mut ndeact = 0;

        let mut tables = self.engine.store().begin();
        tables.bulk_advance(speed, t);

        for vehl in tables.stepping_vehicles(t) {
            nstepped += 1;
            let route = &vehl.route;
            let mut sched = vehl.schedule.clone();
            let mut lvn = vehl.lvn;
            let mut nnd = vehl.nnd;
            let mut nstops = 0usize;
            let mut active = true;
            let mut respawned = false;

            while nnd <= 0 && active {
                lvn += 1;
                self.engine.log(LogEvent::Position {
                    t,
                    vehl: vehl.id,
                    node: route[lvn].node,
                });

                // The vehicle is on a node; serve every stop scheduled
                // there. sched[0] is the head mirror of this node, so the
                // next real stop is sched[1 + nstops].
                while active && route[lvn].node == sched[1 + nstops].loc {
                    let stop = sched[1 + nstops];
                    nstops += 1;
                    match stop.kind {
                        StopKind::VehlDest => {
                            if vehl.is_taxi() && t <= tmin {
                                // Requests may still appear: re-seed the
                                // taxi toward a fresh random destination.
                                let here = route[lvn].node;
                                let dest = self
                                    .engine
                                    .net()
                                    .random_node_excluding(&mut self.rng, here);
                                let kernel = Kernel::new(self.engine.net(), speed, t);
                                let ends = [
                                    Stop::new(
                                        vehl.id,
                                        here,
                                        StopKind::VehlOrig,
                                        vehl.early,
                                        NO_DEADLINE,
                                    ),
                                    Stop::new(
                                        vehl.id,
                                        dest,
                                        StopKind::VehlDest,
                                        vehl.early,
                                        NO_DEADLINE,
                                    ),
                                ];
                                let (new_route, _) = kernel.route_through(&ends);
                                let new_nnd = new_route[1].dist;
                                let new_sched = vec![
                                    Stop::new(
                                        vehl.id,
                                        new_route[1].node,
                                        StopKind::VehlOrig,
                                        vehl.early,
                                        NO_DEADLINE,
                                    ),
                                    ends[1],
                                ];
                                debug!(vehicle = vehl.id, dest, "taxi respawned");
                                tables.set_route(vehl.id, new_route, 0, new_nnd);
                                tables.set_schedule(vehl.id, new_sched);
                                respawned = true;
                            } else {
                                tables.set_vehicle_status(vehl.id, VehlStatus::Arrived);
                                if vehl.is_taxi() {
                                    // Unreachable seeded waypoints must not
                                    // count toward the solution cost.
                                    tables.set_route(vehl.id, route[..=lvn].to_vec(), lvn, 0);
                                }
                                self.engine.log(LogEvent::Arrival { t, vehl: vehl.id });
                                debug!(vehicle = vehl.id, t, "vehicle arrived");
                                active = false;
                                ndeact += 1;
                            }
                        }
                        StopKind::CustOrig => {
                            tables.pickup(vehl.id, stop.owner);
                            self.engine.log(LogEvent::Pickup {
                                t,
                                vehl: vehl.id,
                                cust: stop.owner,
                            });
                        }
                        StopKind::CustDest => {
                            tables.dropoff(vehl.id, stop.owner);
                            self.engine.log(LogEvent::Dropoff {
                                t,
                                vehl: vehl.id,
                                cust: stop.owner,
                            });
                            // The last dropoff after the final request has
                            // appeared retires an empty taxi on the spot.
                            if vehl.is_taxi()
                                && t > tmin
                                && sched[1 + nstops].kind == StopKind::VehlDest
                            {
                                tables.set_vehicle_status(vehl.id, VehlStatus::Arrived);
                                tables.set_route(vehl.id, route[..=lvn].to_vec(), lvn, 0);
                                self.engine.log(LogEvent::Arrival { t, vehl: vehl.id });
                                active = false;
                                ndeact += 1;
                            }
                        }
                        StopKind::VehlOrig => {}
                    }
                    if respawned {
                        break;
                    }
                    tables.mark_visited(stop.owner, stop.loc, t);
                }
                if respawned {
                    break;
                }
                if active {
                    nnd += route[lvn + 1].dist - route[lvn].dist;
                }
            }

            if active && !respawned {
                if nstops > 0 {
                    sched.drain(1..1 + nstops);
                }
                sched[0] = Stop::new(
                    vehl.id,
                    route[lvn + 1].node,
                    StopKind::VehlOrig,
                    vehl.early,
                    vehl.late(),
                );
                if vehl.is_taxi() && t > tmin && sched.len() == 2 {
                    // Every served customer is gone and no request can
                    // appear anymore: the taxi retires where it is.
                    tables.set_vehicle_status(vehl.id, VehlStatus::Arrived);
                    tables.set_route(vehl.id, route[..=lvn].to_vec(), lvn, 0);
                    self.engine.log(LogEvent::Arrival { t, vehl: vehl.id });
                    ndeact += 1;
                } else {
                    tables.set_schedule_progress(vehl.id, sched, lvn, nnd);
                }
            }
        }

        (nstepped, ndeact)
    }
}
