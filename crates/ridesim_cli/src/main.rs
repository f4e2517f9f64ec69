//! Command-line driver: load a road network and problem instance, run the
//! simulation against a chosen matching strategy, write the solution file
//! and optional event log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ridesim_core::config::SimConfig;
use ridesim_core::engine::Engine;
use ridesim_core::files;
use ridesim_core::matching::{BilateralArrangement, GreedyNearest, MatchingRuntime, Strategy};
use ridesim_core::report::{collect_summary, write_solution, EventLog};
use ridesim_core::roadnet::{DijkstraIndex, PathIndex, PrecomputedPathIndex, RoadNet};
use ridesim_core::simulator::Simulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyKind {
    Greedy,
    Bilateral,
}

#[derive(Parser, Debug)]
#[command(name = "ridesim", about = "Batch ride-sharing simulation engine")]
struct Cli {
    /// Node file (`id lng lat`).
    #[arg(long)]
    roadnet: PathBuf,
    /// Edge file (`a b weight`).
    #[arg(long)]
    edges: PathBuf,
    /// Problem instance.
    #[arg(long)]
    problem: PathBuf,
    /// Precomputed path table; falls back to Dijkstra over the edges.
    #[arg(long)]
    gtree: Option<PathBuf>,
    /// Solution output path.
    #[arg(long, default_value = "ridesim.sol")]
    solution: PathBuf,
    /// Event log output path.
    #[arg(long)]
    dataout: Option<PathBuf>,
    /// Simulation-to-real-time ratio.
    #[arg(long, default_value_t = 1.0)]
    time_multiplier: f64,
    /// Vehicle speed in meters per tick.
    #[arg(long, default_value_t = 10)]
    vehicle_speed: i64,
    /// Ticks before an unmatched customer cancels.
    #[arg(long, default_value_t = 60)]
    matching_period: i64,
    /// Re-validate feasibility at commit time.
    #[arg(long)]
    strict_mode: bool,
    /// All trips appear at t = 0.
    #[arg(long)]
    static_mode: bool,
    /// Simulate the drain phase at real speed.
    #[arg(long)]
    full_sim: bool,
    /// RNG seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = StrategyKind::Greedy)]
    strategy: StrategyKind,
}

#[derive(Serialize)]
struct RunRecord {
    problem: String,
    strategy: &'static str,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
    runtime_ms: u128,
    matches: u64,
    rejected: u64,
    base_cost: i64,
    solution_cost: i64,
}

fn enable_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    enable_tracing();
    let cli = Cli::parse();

    let config = SimConfig {
        path_to_roadnet: cli.roadnet.clone(),
        path_to_gtree: cli.gtree.clone(),
        path_to_edges: cli.edges.clone(),
        path_to_problem: cli.problem.clone(),
        path_to_solution: cli.solution.clone(),
        path_to_dataout: cli.dataout.clone(),
        time_multiplier: cli.time_multiplier,
        vehicle_speed: cli.vehicle_speed,
        matching_period: cli.matching_period,
        strict_mode: cli.strict_mode,
        static_mode: cli.static_mode,
        full_sim: cli.full_sim,
        seed: cli.seed,
        ..SimConfig::default()
    };

    tracing::info!(path = %config.path_to_roadnet.display(), "reading nodes");
    let nodes = files::read_nodes(&config.path_to_roadnet).context("reading node file")?;
    tracing::info!(count = nodes.len(), "nodes loaded");

    tracing::info!(path = %config.path_to_edges.display(), "reading edges");
    let edges = files::read_edges(&config.path_to_edges).context("reading edge file")?;

    let index: Box<dyn PathIndex> = match &config.path_to_gtree {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading precomputed path table");
            Box::new(
                PrecomputedPathIndex::from_file(path)
                    .map_err(|e| anyhow!("loading path table: {e}"))?,
            )
        }
        None => {
            tracing::info!("no path table given, building Dijkstra index");
            Box::new(DijkstraIndex::build(&edges))
        }
    };
    let net = RoadNet::with_cache_capacity(nodes, edges, index, config.sp_cache_capacity);

    tracing::info!(path = %config.path_to_problem.display(), "reading problem");
    let problem = files::read_problem(&config.path_to_problem).context("reading problem file")?;
    tracing::info!(
        problem = %problem.name,
        road_network = %problem.road_network,
        trips = problem.all_trips().count(),
        "problem loaded"
    );

    let event_log = match &config.path_to_dataout {
        Some(path) => Some(EventLog::create(path).context("creating event log")?),
        None => None,
    };
    let solution_path = config.path_to_solution.clone();

    let engine = Arc::new(Engine::new(
        net,
        problem,
        config,
        event_log.as_ref().map(|l| l.sender()),
    ));

    let strategy: Box<dyn Strategy> = match cli.strategy {
        StrategyKind::Greedy => Box::new(GreedyNearest::new()),
        StrategyKind::Bilateral => Box::new(BilateralArrangement::new(cli.seed)),
    };
    let strategy_name = match cli.strategy {
        StrategyKind::Greedy => "greedy",
        StrategyKind::Bilateral => "bilateral",
    };
    tracing::info!(strategy = strategy_name, "starting run");

    let start_ts = Utc::now();
    let t0 = Instant::now();

    let matcher = MatchingRuntime::spawn(engine.clone(), strategy);
    let mut sim = Simulator::new(engine.clone());
    sim.run();
    matcher
        .join()
        .map_err(|_| anyhow!("matching thread panicked"))?;

    let summary = collect_summary(&engine);
    write_solution(&solution_path, &summary).context("writing solution file")?;
    tracing::info!(
        matches = summary.matches,
        rejected = summary.rejected,
        solution_cost = summary.solution_cost,
        "run complete"
    );

    let record = RunRecord {
        problem: summary.problem.clone(),
        strategy: strategy_name,
        start_ts,
        end_ts: Utc::now(),
        runtime_ms: t0.elapsed().as_millis(),
        matches: summary.matches,
        rejected: summary.rejected,
        base_cost: summary.base_cost,
        solution_cost: summary.solution_cost,
    };
    println!("{}", serde_json::to_string(&record)?);

    // Close the event queue after the last engine handle is gone so the
    // writer thread drains and exits.
    drop(sim);
    drop(engine);
    if let Some(log) = event_log {
        log.finish().context("flushing event log")?;
    }

    Ok(())
}
