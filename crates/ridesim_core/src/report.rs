//! Run outputs: the typed event log and the solution summary.
//!
//! Event records are produced on the simulator and matching threads and
//! drained by one writer thread through a bounded channel, so log lines
//! stay intact and neither producer blocks on disk for long.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use tracing::warn;

use crate::engine::Engine;
use crate::types::{DistInt, NodeId, SimTime, TripId};

/// Capacity of the event queue between the engine and the writer.
const EVENT_QUEUE_DEPTH: usize = 4096;

/// One line in the event log. The letters match the record types in the
/// file format: V (vehicle moved), P (pickup), D (dropoff), A (arrival),
/// T (timeout), R (route committed).
#[derive(Debug, Clone)]
pub enum LogEvent {
    Position {
        t: SimTime,
        vehl: TripId,
        node: NodeId,
    },
    Pickup {
        t: SimTime,
        vehl: TripId,
        cust: TripId,
    },
    Dropoff {
        t: SimTime,
        vehl: TripId,
        cust: TripId,
    },
    Arrival {
        t: SimTime,
        vehl: TripId,
    },
    Timeout {
        t: SimTime,
        cust: TripId,
    },
    RouteCommitted {
        t: SimTime,
        vehl: TripId,
        blob: Vec<u8>,
    },
}

fn format_event(event: &LogEvent) -> String {
    match event {
        LogEvent::Position { t, vehl, node } => format!("{t} V {vehl} {node}"),
        LogEvent::Pickup { t, vehl, cust } => format!("{t} P {vehl} {cust}"),
        LogEvent::Dropoff { t, vehl, cust } => format!("{t} D {vehl} {cust}"),
        LogEvent::Arrival { t, vehl } => format!("{t} A {vehl}"),
        LogEvent::Timeout { t, cust } => format!("{t} T {cust}"),
        LogEvent::RouteCommitted { t, vehl, blob } => {
            let mut hex = String::with_capacity(blob.len() * 2);
            for byte in blob {
                let _ = write!(hex, "{byte:02x}");
            }
            format!("{t} R {vehl} {hex}")
        }
    }
}

/// Cloneable producer handle. Send never blocks the simulation: when the
/// queue is full the record is dropped with a warning.
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<LogEvent>,
}

impl EventSender {
    pub fn send(&self, event: LogEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("event log queue full, dropping record"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// The writer thread plus the sending side of its queue.
pub struct EventLog {
    tx: Option<SyncSender<LogEvent>>,
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl EventLog {
    /// Open `path` and start the writer thread.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let (tx, rx) = sync_channel(EVENT_QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name("ridesim-eventlog".into())
            .spawn(move || write_events(file, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone().expect("event log already finished"),
        }
    }

    /// Close the queue and wait for the writer to drain it.
    pub fn finish(mut self) -> io::Result<()> {
        self.tx = None;
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::Other, "event log writer panicked"))
            }),
            None => Ok(()),
        }
    }
}

fn write_events(file: File, rx: Receiver<LogEvent>) -> io::Result<()> {
    let mut out = BufWriter::new(file);
    for event in rx {
        writeln!(out, "{}", format_event(&event))?;
    }
    out.flush()
}

/// The end-of-run report written as the solution file header.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionSummary {
    pub problem: String,
    pub road_network: String,
    pub vehicles: usize,
    pub customers: usize,
    pub base_cost: DistInt,
    pub solution_cost: DistInt,
    pub matches: u64,
    pub rejected: u64,
    pub avg_pickup_delay: f64,
    pub avg_trip_delay: f64,
}

/// Assemble the summary from final store state: route costs of every
/// vehicle plus the base cost of every customer that was never assigned,
/// and the pickup/trip delays measured off the stop visit records.
pub fn collect_summary(engine: &Engine) -> SolutionSummary {
    let speed = engine.config().vehicle_speed;
    let mut tables = engine.store().begin();

    let mut solution_cost: DistInt = 0;
    for vehl in tables.all_vehicles() {
        if let Some(last) = vehl.route.last() {
            solution_cost += last.dist;
        }
    }

    let mut pickup_delays: Vec<f64> = Vec::new();
    let mut trip_delays: Vec<f64> = Vec::new();
    for cust in tables.all_customers() {
        if cust.assigned_to.is_none() {
            solution_cost += tables.base_cost(cust.id);
        }
        if let Some(picked) = tables.visited_at(cust.id, cust.orig) {
            pickup_delays.push((picked - cust.early) as f64);
        }
        if let Some(dropped) = tables.visited_at(cust.id, cust.dest) {
            let direct = tables.base_cost(cust.id) as f64 / speed as f64;
            trip_delays.push(dropped as f64 - cust.early as f64 - direct);
        }
    }

    SolutionSummary {
        problem: engine.problem_name().to_string(),
        road_network: engine.road_network().to_string(),
        vehicles: engine.total_vehicles(),
        customers: engine.total_customers(),
        base_cost: engine.base_cost(),
        solution_cost,
        matches: engine.stats().matches(),
        rejected: engine.stats().rejected(),
        avg_pickup_delay: mean(&pickup_delays),
        avg_trip_delay: mean(&trip_delays),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn write_solution(path: &Path, summary: &SolutionSummary) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "{}", render_solution(summary))?;
    out.flush()
}

fn render_solution(s: &SolutionSummary) -> String {
    format!(
        "{}\n{}\nVEHICLES {}\nCUSTOMERS {}\nbase cost {}\nsolution cost {}\nmatches {}\nout-of-sync rejected {}\navg. pickup delay {:.2}\navg. trip delay {:.2}\n",
        s.problem,
        s.road_network,
        s.vehicles,
        s.customers,
        s.base_cost,
        s.solution_cost,
        s.matches,
        s.rejected,
        s.avg_pickup_delay,
        s.avg_trip_delay,
    )
}
