//! Run configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::roadnet::DEFAULT_SP_CACHE_CAPACITY;
use crate::types::{DistInt, SimTime};

/// Everything a run needs beyond the input data itself. Paths identify the
/// four input files and the two outputs; the numeric knobs control pacing,
/// motion and the matching window.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub path_to_roadnet: PathBuf,
    pub path_to_gtree: Option<PathBuf>,
    pub path_to_edges: PathBuf,
    pub path_to_problem: PathBuf,
    pub path_to_solution: PathBuf,
    pub path_to_dataout: Option<PathBuf>,
    /// Ratio of simulation time to real time; the tick interval is
    /// `round(1000 / time_multiplier)` milliseconds.
    pub time_multiplier: f64,
    /// Meters a vehicle travels per tick.
    pub vehicle_speed: DistInt,
    /// Ticks an unmatched customer stays `Waiting` before cancellation.
    pub matching_period: SimTime,
    /// Re-validate feasibility on the synchronized schedule at commit time.
    pub strict_mode: bool,
    /// Rewrite every trip to appear at t = 0.
    pub static_mode: bool,
    /// Keep simulating real motion after the last request window closes
    /// instead of short-circuiting the drain phase.
    pub full_sim: bool,
    /// Capacity of the shortest-path segment cache.
    pub sp_cache_capacity: usize,
    /// Hide already-assigned customers from strategy snapshots.
    pub skip_assigned: bool,
    /// Hide customers that recently failed to match.
    pub skip_delayed: bool,
    /// Ticks a delayed customer stays hidden.
    pub retry_delay: SimTime,
    /// Seed for every RNG in the run.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            path_to_roadnet: PathBuf::new(),
            path_to_gtree: None,
            path_to_edges: PathBuf::new(),
            path_to_problem: PathBuf::new(),
            path_to_solution: PathBuf::from("ridesim.sol"),
            path_to_dataout: None,
            time_multiplier: 1.0,
            vehicle_speed: 10,
            matching_period: 60,
            strict_mode: false,
            static_mode: false,
            full_sim: false,
            sp_cache_capacity: DEFAULT_SP_CACHE_CAPACITY,
            skip_assigned: true,
            skip_delayed: true,
            retry_delay: 10,
            seed: 0,
        }
    }
}

impl SimConfig {
    pub fn with_speed(mut self, speed: DistInt) -> Self {
        self.vehicle_speed = speed;
        self
    }

    pub fn with_matching_period(mut self, period: SimTime) -> Self {
        self.matching_period = period;
        self
    }

    pub fn with_time_multiplier(mut self, multiplier: f64) -> Self {
        self.time_multiplier = multiplier;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_full_sim(mut self, full: bool) -> Self {
        self.full_sim = full;
        self
    }

    /// Real-time length of one tick.
    pub fn sleep_interval(&self) -> Duration {
        assert!(
            self.time_multiplier > 0.0,
            "time multiplier must be positive"
        );
        Duration::from_millis((1000.0 / self.time_multiplier).round() as u64)
    }
}
