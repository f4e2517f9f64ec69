//! The matching runtime and the strategy-facing API.
//!
//! Strategies run on their own OS thread against value snapshots that may
//! be a tick or more stale; [`MatchCtx::commit`] re-acquires the store
//! lock, re-reads the vehicle, and accepts the proposed route/schedule
//! only if it can be synchronized onto the vehicle's current position.
//! A rejected commit is an expected outcome, not an error: the strategy
//! retries with a fresh snapshot, defers the customer, or drops it.

pub mod bilateral;
pub mod greedy;

pub use bilateral::BilateralArrangement;
pub use greedy::GreedyNearest;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::blob;
use crate::engine::Engine;
use crate::grid::SpatialGrid;
use crate::kernel::{check_capacity, check_precedence};
use crate::models::{Customer, Vehicle};
use crate::report::LogEvent;
use crate::roadnet::{haversine, RoadNet};
use crate::types::{
    same_stop, BoundingBox, CustStatus, NodeId, SimTime, Stop, StopKind, TripId, Waypoint,
};

/// Counters shared between the matching thread and the final report.
#[derive(Default)]
pub struct MatchStats {
    matches: AtomicU64,
    rejected: AtomicU64,
}

impl MatchStats {
    pub fn matches(&self) -> u64 {
        self.matches.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn record_matches(&self, n: u64) {
        self.matches.fetch_add(n, Ordering::SeqCst);
    }

    fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }
}

/// Why a commit was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The vehicle's current position can no longer be located on the
    /// proposed route, or the traveled prefix disagrees with it.
    RouteOutOfSync,
    /// The proposed schedule cannot be reconciled with the stops the
    /// vehicle still has to serve.
    ScheduleOutOfSync,
    /// A customer marked for removal no longer has both stops pending.
    MissingDeleteTarget(TripId),
    /// A customer marked for assignment is no longer waiting.
    NotWaiting(TripId),
    /// Strict-mode re-validation failed on the synchronized schedule.
    Infeasible,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::RouteOutOfSync => write!(f, "route out of sync"),
            Rejection::ScheduleOutOfSync => write!(f, "schedule out of sync"),
            Rejection::MissingDeleteTarget(id) => {
                write!(f, "customer {id} can no longer be removed")
            }
            Rejection::NotWaiting(id) => write!(f, "customer {id} is no longer waiting"),
            Rejection::Infeasible => write!(f, "synchronized schedule is infeasible"),
        }
    }
}

/// A successful commit: the synchronized route and schedule as written,
/// for strategies that keep local copies of vehicle state.
#[derive(Debug, Clone)]
pub struct CommitOk {
    pub route: Vec<Waypoint>,
    pub schedule: Vec<Stop>,
    pub nnd: crate::types::DistInt,
}

/// Locate the vehicle's current waypoint in the proposed route, verify
/// the traveled prefix agrees, and trim it. Every added customer must
/// have origin and destination still ahead of the current position.
fn sync_route(
    new_rte: &[Waypoint],
    cur_rte: &[Waypoint],
    cur_lvn: usize,
    adds: &[Customer],
) -> Option<Vec<Waypoint>> {
    if cur_lvn == 0 {
        return Some(new_rte.to_vec());
    }

    let cur_node = cur_rte[cur_lvn].node;
    let x = new_rte.iter().position(|w| w.node == cur_node)?;

    for cust in adds {
        // The current waypoint is already behind the vehicle; the pickup
        // must lie strictly after it.
        let o = new_rte[x + 1..].iter().position(|w| w.node == cust.orig)?;
        let abs_o = x + 1 + o;
        new_rte[abs_o..].iter().position(|w| w.node == cust.dest)?;
    }

    // Walk both routes backward from the match point; every waypoint of
    // the traveled prefix must agree.
    let mut i = x;
    let mut j = cur_lvn;
    loop {
        if new_rte[i].node != cur_rte[j].node || (i > 0 && j == 0) {
            return None;
        }
        if i > 0 && j > 0 {
            i -= 1;
            j -= 1;
        } else if i == 0 {
            break;
        }
    }

    Some(new_rte[x..].to_vec())
}

/// Rebuild the schedule against current state: keep the current head
/// stop, then admit each proposed stop only if the vehicle still has it
/// pending or it belongs to a customer being added, and finally verify
/// the result is served in order by the synchronized route.
fn sync_schedule(
    new_sch: &[Stop],
    cur_sch: &[Stop],
    sync_rte: &[Waypoint],
    adds: &[Customer],
) -> Option<Vec<Stop>> {
    // When the vehicle is approaching a stop, the head and first stop
    // share a location; the route-order check below cannot distinguish a
    // pickup placed before that stop, so require each added customer's
    // pair to appear after it in the proposed schedule.
    if cur_sch[0].loc == cur_sch[1].loc {
        let next = cur_sch[1];
        let x = new_sch
            .iter()
            .position(|s| s.loc == next.loc && s.kind == next.kind)
            .unwrap_or(new_sch.len());
        for cust in adds {
            let o = new_sch[x..]
                .iter()
                .position(|s| s.loc == cust.orig && s.kind == StopKind::CustOrig)?;
            let abs_o = x + o;
            new_sch[abs_o..]
                .iter()
                .position(|s| s.loc == cust.dest && s.kind == StopKind::CustDest)?;
        }
    }

    let mut out = vec![cur_sch[0]];
    for stop in &new_sch[1..] {
        let in_cur = cur_sch.iter().any(|s| same_stop(s, stop));
        let is_added = adds
            .iter()
            .any(|c| c.id == stop.owner && (stop.loc == c.orig || stop.loc == c.dest));
        if in_cur || is_added {
            out.push(*stop);
        }
    }

    // Every synchronized stop must appear in order along the route,
    // starting past the last-visited waypoint.
    let mut x = 1;
    for stop in &out {
        let y = sync_rte[x.min(sync_rte.len())..]
            .iter()
            .position(|w| w.node == stop.loc)?;
        x += y;
    }

    Some(out)
}

/// Round context handed to every strategy hook.
pub struct MatchCtx<'a> {
    /// Matchable vehicles at the start of the round.
    pub vehicles: Vec<Vehicle>,
    /// Waiting customers at the start of the round, after the runtime's
    /// assigned/delayed filters.
    pub customers: Vec<Customer>,
    engine: &'a Engine,
    delay: &'a mut HashMap<TripId, SimTime>,
}

impl<'a> MatchCtx<'a> {
    pub fn now(&self) -> SimTime {
        self.engine.now()
    }

    pub fn net(&self) -> &'a RoadNet {
        self.engine.net()
    }

    pub fn kernel(&self) -> crate::kernel::Kernel<'a> {
        self.engine.kernel()
    }

    /// Validate and write an assignment. See the module docs; on success
    /// the returned [`CommitOk`] carries the state as written.
    pub fn commit(
        &mut self,
        adds: &[Customer],
        dels: &[TripId],
        vehl: &Vehicle,
        new_rte: &[Waypoint],
        new_sch: &[Stop],
    ) -> Result<CommitOk, Rejection> {
        let result = self.try_commit(adds, dels, vehl, new_rte, new_sch);
        match &result {
            Ok(_) => {
                self.engine.stats().record_matches(adds.len() as u64);
            }
            Err(rejection) => {
                debug!(vehicle = vehl.id, %rejection, "commit rejected");
                self.engine.stats().record_rejection();
            }
        }
        result
    }

    fn try_commit(
        &mut self,
        adds: &[Customer],
        dels: &[TripId],
        vehl: &Vehicle,
        new_rte: &[Waypoint],
        new_sch: &[Stop],
    ) -> Result<CommitOk, Rejection> {
        let mut tables = self.engine.store().begin();

        for cust in adds {
            if tables.customer(cust.id).status != CustStatus::Waiting {
                return Err(Rejection::NotWaiting(cust.id));
            }
        }

        let cur = tables.vehicle(vehl.id);
        let sync_rte =
            sync_route(new_rte, &cur.route, cur.lvn, adds).ok_or(Rejection::RouteOutOfSync)?;

        for &cust_id in dels {
            let pending = cur.schedule.iter().filter(|s| s.owner == cust_id).count();
            if pending < 2 {
                return Err(Rejection::MissingDeleteTarget(cust_id));
            }
        }

        let sync_sch = sync_schedule(new_sch, &cur.schedule, &sync_rte, adds)
            .ok_or(Rejection::ScheduleOutOfSync)?;

        if self.engine.config().strict_mode {
            let feasible = check_precedence(vehl.id, &sync_sch)
                && check_capacity(cur.capacity - cur.load, &sync_sch)
                && self.kernel().check_time_windows(&sync_sch, &sync_rte);
            if !feasible {
                return Err(Rejection::Infeasible);
            }
        }

        tables.set_route(vehl.id, sync_rte.clone(), 0, cur.nnd);
        tables.set_schedule(vehl.id, sync_sch.clone());
        tables.adjust_queued(vehl.id, adds.len() as i32 - dels.len() as i32);
        for cust in adds {
            tables.assign_customer(cust.id, Some(vehl.id));
        }
        for &cust_id in dels {
            tables.assign_customer(cust_id, None);
        }
        drop(tables);

        match blob::encode_route(&sync_rte) {
            Ok(encoded) => self.engine.log(LogEvent::RouteCommitted {
                t: self.engine.now(),
                vehl: vehl.id,
                blob: encoded,
            }),
            Err(e) => warn!("failed to encode committed route: {e}"),
        }

        Ok(CommitOk {
            nnd: cur.nnd,
            route: sync_rte,
            schedule: sync_sch,
        })
    }

    /// Commit, or record the customers in the delay map so the runtime
    /// hides them for the configured retry window.
    pub fn assign_or_delay(
        &mut self,
        adds: &[Customer],
        dels: &[TripId],
        vehl: &Vehicle,
        new_rte: &[Waypoint],
        new_sch: &[Stop],
    ) -> Option<CommitOk> {
        match self.commit(adds, dels, vehl, new_rte, new_sch) {
            Ok(ok) => {
                for cust in adds {
                    self.delay.remove(&cust.id);
                }
                Some(ok)
            }
            Err(_) => {
                let now = self.engine.now();
                for cust in adds {
                    self.delay.insert(cust.id, now);
                }
                None
            }
        }
    }

    /// Hide a customer from upcoming rounds for the retry window.
    pub fn delay(&mut self, cust: TripId) {
        let now = self.engine.now();
        self.delay.insert(cust, now);
    }
}

/// A matching strategy. Hooks default to no-ops; a strategy overrides the
/// ones its algorithm needs and consumes only snapshots, the kernel, its
/// own spatial index and the commit API.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Seconds between rounds.
    fn batch_time(&self) -> u64 {
        1
    }

    /// Called at the top of every round, before any snapshot hook. Grid
    /// rebuilds belong here.
    fn begin(&mut self, _ctx: &mut MatchCtx) {}

    fn handle_vehicle(&mut self, _vehl: &Vehicle, _ctx: &mut MatchCtx) {}

    fn handle_customer(&mut self, _cust: &Customer, _ctx: &mut MatchCtx) {}

    /// Bulk matching over the round's snapshots.
    fn do_match(&mut self, _ctx: &mut MatchCtx) {}

    /// Called once on the matching thread after the simulator finishes.
    fn end(&mut self, _ctx: &mut MatchCtx) {}
}

/// Drives a strategy until the engine signals shutdown.
pub struct MatchingRuntime {
    engine: Arc<Engine>,
    delay: HashMap<TripId, SimTime>,
}

impl MatchingRuntime {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            delay: HashMap::new(),
        }
    }

    /// Spawn the matching thread.
    pub fn spawn(engine: Arc<Engine>, mut strategy: Box<dyn Strategy>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("ridesim-matching".into())
            .spawn(move || {
                let mut runtime = MatchingRuntime::new(engine);
                runtime.run(strategy.as_mut());
            })
            .expect("failed to spawn matching thread")
    }

    /// One round: snapshots, filters, then the strategy hooks.
    pub fn round(&mut self, strategy: &mut dyn Strategy) {
        let now = self.engine.now();
        let config = self.engine.config();
        let vehicles = self.engine.store().matchable_vehicles(now);
        let mut customers = self.engine.store().waiting_customers(now);
        if config.skip_assigned {
            customers.retain(|c| c.assigned_to.is_none());
        }
        if config.skip_delayed {
            let delay = &self.delay;
            customers.retain(|c| {
                delay
                    .get(&c.id)
                    .map_or(true, |&since| now >= since + config.retry_delay)
            });
        }

        let mut ctx = MatchCtx {
            vehicles,
            customers,
            engine: self.engine.as_ref(),
            delay: &mut self.delay,
        };
        strategy.begin(&mut ctx);
        let vehicles = ctx.vehicles.clone();
        for vehl in &vehicles {
            strategy.handle_vehicle(vehl, &mut ctx);
        }
        let customers = ctx.customers.clone();
        for cust in &customers {
            strategy.handle_customer(cust, &mut ctx);
        }
        strategy.do_match(&mut ctx);
    }

    /// The matching loop: rounds paced by the strategy's batch time until
    /// the simulator signals completion, then the strategy's `end` hook.
    pub fn run(&mut self, strategy: &mut dyn Strategy) {
        info!(strategy = strategy.name(), "matching thread started");
        while !self.engine.is_done() {
            let t0 = Instant::now();
            self.round(strategy);
            let elapsed = t0.elapsed();
            let batch = Duration::from_secs(strategy.batch_time().max(1));
            if elapsed > batch {
                warn!(
                    strategy = strategy.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    batch_ms = batch.as_millis() as u64,
                    "matching round exceeded its batch time"
                );
            } else {
                // Sleep in slices so shutdown is observed promptly even
                // with long batch times.
                let mut remaining = batch - elapsed;
                while !remaining.is_zero() && !self.engine.is_done() {
                    let slice = remaining.min(Duration::from_millis(25));
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
        }

        let now = self.engine.now();
        let mut ctx = MatchCtx {
            vehicles: self.engine.store().matchable_vehicles(now),
            customers: self.engine.store().waiting_customers(now),
            engine: self.engine.as_ref(),
            delay: &mut self.delay,
        };
        strategy.end(&mut ctx);
        info!(strategy = strategy.name(), "matching thread finished");
    }
}

/// Per-round candidate lookup shared by the built-in strategies: the
/// spatial grid plus the round's vehicle snapshots by id, kept current
/// with the results of this round's own commits.
pub struct CandidateIndex {
    grid: SpatialGrid,
    by_id: HashMap<TripId, Vehicle>,
}

impl CandidateIndex {
    pub fn new(bbox: BoundingBox) -> Self {
        Self {
            grid: SpatialGrid::new(bbox),
            by_id: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.grid.clear();
        self.by_id.clear();
    }

    pub fn insert(&mut self, net: &RoadNet, vehl: &Vehicle) {
        self.grid.insert(vehl.id, net.node(vehl.last_visited_node()));
        self.by_id.insert(vehl.id, vehl.clone());
    }

    pub fn get(&self, id: TripId) -> Option<&Vehicle> {
        self.by_id.get(&id)
    }

    /// Candidate ids within `radius_m` of a node, nearest first by
    /// haversine distance from their last-visited node.
    pub fn within(&self, net: &RoadNet, radius_m: f64, origin: NodeId) -> Vec<TripId> {
        let origin_pt = net.node(origin);
        let mut ids = self.grid.within(radius_m, origin_pt);
        ids.sort_by(|&a, &b| {
            let da = self
                .get(a)
                .map(|v| haversine(net.node(v.last_visited_node()), origin_pt))
                .unwrap_or(f64::INFINITY);
            let db = self
                .get(b)
                .map(|v| haversine(net.node(v.last_visited_node()), origin_pt))
                .unwrap_or(f64::INFINITY);
            da.total_cmp(&db)
        });
        ids
    }

    /// Refresh the local copy of a vehicle after a successful commit.
    pub fn apply(&mut self, id: TripId, ok: &CommitOk, queued_delta: i32) {
        if let Some(vehl) = self.by_id.get_mut(&id) {
            vehl.route = ok.route.clone();
            vehl.lvn = 0;
            vehl.nnd = ok.nnd;
            vehl.schedule = ok.schedule.clone();
            vehl.queued += queued_delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NO_DEADLINE;

    fn wp(dist: i64, node: NodeId) -> Waypoint {
        Waypoint::new(dist, node)
    }

    fn cust(id: TripId, orig: NodeId, dest: NodeId) -> Customer {
        Customer {
            id,
            orig,
            dest,
            early: 0,
            late: 100,
            load: 1,
            status: CustStatus::Waiting,
            assigned_to: None,
        }
    }

    #[test]
    fn sync_route_is_identity_for_an_unmoved_vehicle() {
        let new_rte = vec![wp(10, 1), wp(20, 2), wp(30, 3)];
        let cur_rte = vec![wp(0, 0), wp(10, 1), wp(20, 2), wp(30, 3)];
        let synced = sync_route(&new_rte, &cur_rte, 0, &[]).unwrap();
        assert_eq!(synced, new_rte);
    }

    #[test]
    fn sync_route_trims_the_agreed_prefix() {
        // Vehicle crossed node 1; the new route still begins there.
        let new_rte = vec![wp(10, 1), wp(10, 1), wp(20, 2), wp(30, 3)];
        let cur_rte = vec![wp(0, 0), wp(10, 1), wp(20, 2), wp(30, 3)];
        let synced = sync_route(&new_rte, &cur_rte, 1, &[cust(7, 1, 2)]);
        // Current node found at index 0: nothing to trim, pickup ahead.
        assert_eq!(synced.unwrap()[0], wp(10, 1));
    }

    #[test]
    fn sync_route_rejects_when_position_is_missing_or_prefix_disagrees() {
        let cur_rte = vec![wp(0, 0), wp(10, 1), wp(20, 5), wp(30, 3)];
        // Node 5 does not appear in the proposal.
        let missing = vec![wp(10, 1), wp(20, 2), wp(30, 3)];
        assert!(sync_route(&missing, &cur_rte, 2, &[]).is_none());

        // Node 5 appears, but the prefix behind it disagrees.
        let disagreeing = vec![wp(0, 4), wp(10, 5), wp(20, 3)];
        assert!(sync_route(&disagreeing, &cur_rte, 2, &[]).is_none());
    }

    #[test]
    fn sync_route_requires_added_stops_ahead_of_the_vehicle() {
        // Vehicle already crossed node 2, the proposed pickup location.
        let new_rte = vec![wp(0, 1), wp(10, 2), wp(20, 3)];
        let cur_rte = vec![wp(0, 1), wp(10, 2), wp(20, 3)];
        assert!(sync_route(&new_rte, &cur_rte, 1, &[cust(7, 2, 3)]).is_none());
        // Without additions the same motion state is fine.
        assert!(sync_route(&new_rte, &cur_rte, 1, &[]).is_some());
    }

    #[test]
    fn sync_schedule_keeps_current_and_added_stops_only() {
        let vo = |loc| Stop::new(9, loc, StopKind::VehlOrig, 0, 100);
        let vd = |loc| Stop::new(9, loc, StopKind::VehlDest, 0, 100);
        let co = |id, loc| Stop::new(id, loc, StopKind::CustOrig, 0, 100);
        let cd = |id, loc| Stop::new(id, loc, StopKind::CustDest, 0, 100);

        let cur_sch = vec![vo(1), vd(3)];
        let new_sch = vec![vo(1), co(7, 1), cd(7, 2), vd(3)];
        let sync_rte = vec![wp(0, 0), wp(10, 1), wp(10, 1), wp(20, 2), wp(30, 3)];
        let out = sync_schedule(&new_sch, &cur_sch, &sync_rte, &[cust(7, 1, 2)]).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], co(7, 1));

        // A stop belonging to neither current schedule nor additions is
        // dropped (its customer was served since the snapshot).
        let stale = vec![vo(1), co(8, 2), cd(8, 3), vd(3)];
        let out = sync_schedule(&stale, &cur_sch, &sync_rte, &[]).unwrap();
        assert_eq!(out, vec![vo(1), vd(3)]);
    }

    #[test]
    fn sync_schedule_rejects_stops_behind_the_synchronized_route() {
        let vo = |loc| Stop::new(9, loc, StopKind::VehlOrig, 0, 100);
        let vd = |loc| Stop::new(9, loc, StopKind::VehlDest, 0, 100);
        let co = |id, loc| Stop::new(id, loc, StopKind::CustOrig, 0, 100);
        let cd = |id, loc| Stop::new(id, loc, StopKind::CustDest, 0, 100);

        // Vehicle has moved past node 1 where the proposal still wants a
        // pickup; head stop is now at node 2.
        let cur_sch = vec![vo(2), vd(3)];
        let new_sch = vec![vo(1), co(7, 1), cd(7, 2), vd(3)];
        let sync_rte = vec![wp(10, 1), wp(10, 1), wp(20, 2), wp(30, 3)];
        assert!(sync_schedule(&new_sch, &cur_sch, &sync_rte, &[cust(7, 1, 2)]).is_none());
    }

    #[test]
    fn sync_schedule_at_stop_special_case_requires_pairs_after_the_stop() {
        let vo = |loc| Stop::new(9, loc, StopKind::VehlOrig, 0, NO_DEADLINE);
        let vd = |loc| Stop::new(9, loc, StopKind::VehlDest, 0, NO_DEADLINE);
        let co = |id, loc| Stop::new(id, loc, StopKind::CustOrig, 0, 100);
        let cd = |id, loc| Stop::new(id, loc, StopKind::CustDest, 0, 100);

        // Vehicle is approaching a stop (head and first stop share loc 2).
        let cur_sch = vec![vo(2), co(8, 2), cd(8, 3), vd(3)];
        // Proposal slips customer 7's pickup before that stop.
        let bad = vec![vo(1), co(7, 1), co(8, 2), cd(8, 3), cd(7, 3), vd(3)];
        let rte = vec![wp(0, 1), wp(10, 2), wp(10, 2), wp(20, 3), wp(20, 3), wp(20, 3)];
        assert!(sync_schedule(&bad, &cur_sch, &rte, &[cust(7, 1, 3)]).is_none());

        // Pickup after the stop is admissible.
        let good = vec![vo(2), co(8, 2), cd(8, 3), co(7, 3), cd(7, 3), vd(3)];
        let rte = vec![wp(0, 2), wp(0, 2), wp(10, 3), wp(10, 3), wp(10, 3), wp(10, 3)];
        assert!(sync_schedule(&good, &cur_sch, &rte, &[cust(7, 3, 3)]).is_some());
    }
}
