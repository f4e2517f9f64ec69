//! Parsers for the plain-text input files.
//!
//! Three formats, all whitespace-separated with `#` comment lines:
//! nodes (`id lng lat`), edges (`a b weight`, undirected, meters), and the
//! problem instance (two header lines naming the problem and its road
//! network, then one trip per line `id orig dest early late load`).

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::models::{ProblemSet, Trip};
use crate::roadnet::EdgeMap;
use crate::types::{DistInt, NodeId, Point};

#[derive(Debug)]
pub enum FileError {
    Io(std::io::Error),
    Parse {
        path: String,
        line: usize,
        message: String,
    },
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileError::Io(e) => write!(f, "io error: {e}"),
            FileError::Parse {
                path,
                line,
                message,
            } => write!(f, "{path}:{line}: {message}"),
        }
    }
}

impl std::error::Error for FileError {}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        FileError::Io(e)
    }
}

fn parse_err(path: &Path, line: usize, message: impl Into<String>) -> FileError {
    FileError::Parse {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}

fn data_lines(path: &Path) -> Result<Vec<(usize, String)>, FileError> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push((idx + 1, trimmed.to_string()));
    }
    Ok(out)
}

fn field<T: std::str::FromStr>(
    path: &Path,
    line_no: usize,
    fields: &[&str],
    idx: usize,
    name: &str,
) -> Result<T, FileError> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| parse_err(path, line_no, format!("missing field `{name}`")))?;
    raw.parse()
        .map_err(|_| parse_err(path, line_no, format!("bad {name}: `{raw}`")))
}

/// Read the node file (`id lng lat`).
pub fn read_nodes(path: &Path) -> Result<HashMap<NodeId, Point>, FileError> {
    let mut nodes = HashMap::new();
    for (line_no, line) in data_lines(path)? {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let id: NodeId = field(path, line_no, &fields, 0, "node id")?;
        let lng: f64 = field(path, line_no, &fields, 1, "longitude")?;
        let lat: f64 = field(path, line_no, &fields, 2, "latitude")?;
        nodes.insert(id, Point { lng, lat });
    }
    Ok(nodes)
}

/// Read the edge file (`a b weight`); both directions are inserted.
/// Weights are rounded to integer meters.
pub fn read_edges(path: &Path) -> Result<EdgeMap, FileError> {
    let mut edges: EdgeMap = HashMap::new();
    for (line_no, line) in data_lines(path)? {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let a: NodeId = field(path, line_no, &fields, 0, "from node")?;
        let b: NodeId = field(path, line_no, &fields, 1, "to node")?;
        let weight: f64 = field(path, line_no, &fields, 2, "weight")?;
        let w = weight.round() as DistInt;
        edges.entry(a).or_default().insert(b, w);
        edges.entry(b).or_default().insert(a, w);
    }
    Ok(edges)
}

/// Read a problem instance: problem name, road-network name, then trips.
pub fn read_problem(path: &Path) -> Result<ProblemSet, FileError> {
    let lines = data_lines(path)?;
    let mut iter = lines.into_iter();
    let (_, name) = iter
        .next()
        .ok_or_else(|| parse_err(path, 1, "missing problem name header"))?;
    let (_, road_network) = iter
        .next()
        .ok_or_else(|| parse_err(path, 2, "missing road network header"))?;

    let mut set = ProblemSet {
        name,
        road_network,
        ..ProblemSet::default()
    };
    for (line_no, line) in iter {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let trip = Trip {
            id: field(path, line_no, &fields, 0, "trip id")?,
            orig: field(path, line_no, &fields, 1, "origin")?,
            dest: field(path, line_no, &fields, 2, "destination")?,
            early: field(path, line_no, &fields, 3, "early")?,
            late: field(path, line_no, &fields, 4, "late")?,
            load: field(path, line_no, &fields, 5, "load")?,
        };
        set.push(trip);
    }
    Ok(set)
}
