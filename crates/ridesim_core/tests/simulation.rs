//! End-to-end scenarios driven tick by tick for determinism, plus one
//! threaded smoke run over the full two-thread engine.

use std::sync::Arc;

use ridesim_core::config::SimConfig;
use ridesim_core::engine::Engine;
use ridesim_core::kernel::{check_precedence, Insertion};
use ridesim_core::matching::{GreedyNearest, MatchCtx, MatchingRuntime, Rejection, Strategy};
use ridesim_core::models::{Customer, ProblemSet, Trip, Vehicle};
use ridesim_core::report::{collect_summary, write_solution, EventLog};
use ridesim_core::simulator::Simulator;
use ridesim_core::test_support::{line_engine, line_network};
use ridesim_core::types::{CustStatus, StopKind, VehlStatus};

/// The quantified per-tick invariants, checked over every active vehicle.
fn assert_invariants(engine: &Engine) {
    for v in engine.store().all_vehicles() {
        if v.status != VehlStatus::Enroute {
            continue;
        }
        assert!(v.lvn < v.route.len(), "lvn within route");
        assert!(v.nnd >= 0, "nnd non-negative after step");
        assert_eq!(
            v.schedule[0].loc,
            v.route[v.lvn + 1].node,
            "schedule head mirrors the approached node"
        );
        assert_eq!(v.schedule[v.schedule.len() - 1].kind, StopKind::VehlDest);
        assert!(check_precedence(v.id, &v.schedule), "precedence holds");
    }
}

#[test]
fn single_vehicle_single_customer_line() {
    let engine = Arc::new(line_engine());
    let mut runtime = MatchingRuntime::new(engine.clone());
    let mut strategy = GreedyNearest::new();
    let mut sim = Simulator::new(engine.clone());

    // Match at t = 0, before any motion.
    runtime.round(&mut strategy);
    assert_eq!(engine.stats().matches(), 1);
    assert_invariants(&engine);

    // Tick 1: vehicle reaches B and picks up.
    sim.tick();
    assert_invariants(&engine);
    let v = &engine.store().all_vehicles()[0];
    assert_eq!(v.lvn, 1);
    assert_eq!(v.load, 1);
    assert_eq!(engine.store().all_customers()[0].status, CustStatus::Onboard);

    // Tick 2: dropoff at C. Tick 3: arrival at D.
    sim.tick();
    assert_invariants(&engine);
    assert_eq!(engine.store().all_customers()[0].status, CustStatus::Arrived);
    sim.tick();
    let v = &engine.store().all_vehicles()[0];
    assert_eq!(v.status, VehlStatus::Arrived);
    assert_eq!(sim.active_vehicles(), 0);

    let summary = collect_summary(&engine);
    assert_eq!(summary.matches, 1);
    assert_eq!(summary.solution_cost, 30);
    // Customer 7's direct trip is one 10 m edge.
    let base = engine.store().begin().base_cost(7);
    assert_eq!(base, 10);
    // Picked up at the first possible tick, delivered with no detour.
    assert_eq!(summary.avg_pickup_delay, 0.0);
    assert_eq!(summary.avg_trip_delay, 0.0);
}

fn capacity_one_problem() -> ProblemSet {
    let mut set = ProblemSet {
        name: "cap1".into(),
        road_network: "line4".into(),
        ..ProblemSet::default()
    };
    set.push(Trip { id: 1, orig: 0, dest: 3, early: 0, late: 100, load: -1 });
    set.push(Trip { id: 7, orig: 1, dest: 2, early: 0, late: 90, load: 1 });
    set.push(Trip { id: 8, orig: 1, dest: 2, early: 0, late: 90, load: 1 });
    set
}

#[test]
fn capacity_one_matches_one_and_times_out_the_other() {
    let net = line_network(4, 10);
    let config = SimConfig::default().with_speed(10).with_matching_period(5);
    let engine = Arc::new(Engine::new(net, capacity_one_problem(), config, None));
    let mut runtime = MatchingRuntime::new(engine.clone());
    let mut strategy = GreedyNearest::new();
    let mut sim = Simulator::new(engine.clone());

    runtime.round(&mut strategy);
    assert_eq!(engine.stats().matches(), 1);

    // Run past the matching period; the unmatched twin cancels.
    while !sim.finished() {
        sim.tick();
        assert_invariants(&engine);
    }
    let customers = engine.store().all_customers();
    let arrived = customers
        .iter()
        .filter(|c| c.status == CustStatus::Arrived)
        .count();
    let canceled = customers
        .iter()
        .filter(|c| c.status == CustStatus::Canceled)
        .count();
    assert_eq!((arrived, canceled), (1, 1));
}

/// Plans an assignment in one round and commits the stale plan later.
#[derive(Default)]
struct StalePlanner {
    plan: Option<(Vehicle, Customer, Insertion)>,
    outcome: Option<Result<(), Rejection>>,
}

impl Strategy for StalePlanner {
    fn name(&self) -> &'static str {
        "stale-planner"
    }

    fn handle_customer(&mut self, cust: &Customer, ctx: &mut MatchCtx) {
        if self.plan.is_none() {
            let vehl = ctx.vehicles[0].clone();
            let ins = ctx.kernel().insert_customer(&vehl, cust);
            self.plan = Some((vehl, cust.clone(), ins));
        }
    }

    fn do_match(&mut self, ctx: &mut MatchCtx) {
        if let Some((vehl, cust, ins)) = self.plan.take() {
            let result = ctx
                .commit(&[cust], &[], &vehl, &ins.route, &ins.schedule)
                .map(|_| ());
            self.outcome = Some(result);
        }
    }
}

#[test]
fn commit_computed_before_motion_fails_once_the_stop_is_passed() {
    let engine = Arc::new(line_engine());
    let mut runtime = MatchingRuntime::new(engine.clone());
    let mut sim = Simulator::new(engine.clone());

    // Plan the insertion from the t = 0 snapshot without committing.
    let mut planner = StalePlanner::default();
    let mut capture = StalePlanner::default();
    // First round only runs the planning hook.
    struct PlanOnly<'a>(&'a mut StalePlanner);
    impl Strategy for PlanOnly<'_> {
        fn name(&self) -> &'static str {
            "plan-only"
        }
        fn handle_customer(&mut self, cust: &Customer, ctx: &mut MatchCtx) {
            self.0.handle_customer(cust, ctx);
        }
    }
    runtime.round(&mut PlanOnly(&mut planner));
    assert!(planner.plan.is_some());

    // The vehicle crosses B, the planned pickup node, before the commit.
    sim.tick();
    let v = &engine.store().all_vehicles()[0];
    assert_eq!(v.lvn, 1);

    capture.plan = planner.plan.take();
    runtime.round(&mut capture);
    assert!(matches!(capture.outcome, Some(Err(_))));
    assert_eq!(engine.stats().rejected(), 1);
    assert_eq!(engine.stats().matches(), 0);

    // The failed commit left no trace.
    let v = &engine.store().all_vehicles()[0];
    assert_eq!(v.queued, 0);
    let cust = &engine.store().all_customers()[0];
    assert_eq!(cust.status, CustStatus::Waiting);
    assert_eq!(cust.assigned_to, None);
}

#[test]
fn tight_deadline_customer_needs_a_colocated_vehicle() {
    // late = early + base_cost / speed: only a vehicle already at the
    // origin can serve the trip in time.
    let net = line_network(4, 10);
    let mut set = ProblemSet {
        name: "tight".into(),
        road_network: "line4".into(),
        ..ProblemSet::default()
    };
    // Vehicle 1 is approaching the customer's origin; vehicle 2 comes
    // from the far end of the line.
    set.push(Trip { id: 1, orig: 0, dest: 3, early: 0, late: 100, load: -1 });
    set.push(Trip { id: 2, orig: 3, dest: 0, early: 0, late: 100, load: -1 });
    set.push(Trip { id: 7, orig: 1, dest: 2, early: 0, late: 1, load: 1 });
    let config = SimConfig::default().with_speed(10);
    let engine = Arc::new(Engine::new(net, set, config, None));

    let kernel = engine.kernel();
    let vehicles = engine.store().matchable_vehicles(0);
    let cust = engine.store().waiting_customers(0)[0].clone();

    let reaches = kernel.insert_customer(&vehicles[0], &cust);
    assert!(kernel.check_time_windows(&reaches.schedule, &reaches.route));

    let distant = kernel.insert_customer(&vehicles[1], &cust);
    assert!(!kernel.check_time_windows(&distant.schedule, &distant.route));
}

#[test]
fn threaded_run_produces_solution_and_event_log() {
    let mut dataout = std::env::temp_dir();
    dataout.push(format!("ridesim-sim-dataout-{}", std::process::id()));
    let mut solution = std::env::temp_dir();
    solution.push(format!("ridesim-sim-solution-{}", std::process::id()));

    let log = EventLog::create(&dataout).unwrap();
    let net = line_network(4, 10);
    let config = SimConfig::default()
        .with_speed(10)
        .with_matching_period(5)
        .with_time_multiplier(100.0);
    let engine = Arc::new(Engine::new(
        net,
        ridesim_core::test_support::line_problem(),
        config,
        Some(log.sender()),
    ));

    let matcher = MatchingRuntime::spawn(engine.clone(), Box::new(GreedyNearest::new()));
    let mut sim = Simulator::new(engine.clone());
    sim.run();
    matcher.join().expect("matching thread");

    let summary = collect_summary(&engine);
    write_solution(&solution, &summary).unwrap();
    // Release every engine handle so the event queue closes and the
    // writer drains.
    drop(sim);
    drop(engine);
    log.finish().unwrap();

    let sol_text = std::fs::read_to_string(&solution).unwrap();
    assert!(sol_text.starts_with("tiny\nline4\nVEHICLES 1\nCUSTOMERS 1\n"));
    assert!(sol_text.contains("base cost 40"));

    let events = std::fs::read_to_string(&dataout).unwrap();
    // Motion and arrival records are always present.
    assert!(events.lines().any(|l| l.contains(" V 1 ")));
    assert!(events.lines().any(|l| l.contains(" A 1")));
}
