//! Byte-image codec for waypoint and stop sequences.
//!
//! Route-committed log records carry the synchronized route as an opaque
//! blob; the encoding is a one-byte version header followed by the bincode
//! image of the sequence. Decoding a blob returns the original sequence
//! bit-for-bit.

use std::fmt;

use crate::types::{Stop, Waypoint};

const BLOB_VERSION: u8 = 1;

#[derive(Debug)]
pub enum BlobError {
    Empty,
    UnsupportedVersion(u8),
    Codec(bincode::Error),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::Empty => write!(f, "blob is empty"),
            BlobError::UnsupportedVersion(v) => write!(f, "unsupported blob version {v}"),
            BlobError::Codec(e) => write!(f, "blob codec error: {e}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<bincode::Error> for BlobError {
    fn from(e: bincode::Error) -> Self {
        BlobError::Codec(e)
    }
}

pub fn encode_route(wayps: &[Waypoint]) -> Result<Vec<u8>, BlobError> {
    encode(wayps)
}

pub fn decode_route(buf: &[u8]) -> Result<Vec<Waypoint>, BlobError> {
    decode(buf)
}

pub fn encode_schedule(stops: &[Stop]) -> Result<Vec<u8>, BlobError> {
    encode(stops)
}

pub fn decode_schedule(buf: &[u8]) -> Result<Vec<Stop>, BlobError> {
    decode(buf)
}

fn encode<T: serde::Serialize>(items: &[T]) -> Result<Vec<u8>, BlobError> {
    let mut out = vec![BLOB_VERSION];
    out.extend(bincode::serialize(items)?);
    Ok(out)
}

fn decode<T: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<Vec<T>, BlobError> {
    let (&version, body) = buf.split_first().ok_or(BlobError::Empty)?;
    if version != BLOB_VERSION {
        return Err(BlobError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StopKind, NO_DEADLINE};

    #[test]
    fn route_blob_round_trips() {
        let route = vec![
            Waypoint::new(0, 5),
            Waypoint::new(10, 5),
            Waypoint::new(35, 8),
        ];
        let blob = encode_route(&route).unwrap();
        assert_eq!(decode_route(&blob).unwrap(), route);
    }

    #[test]
    fn schedule_blob_round_trips_with_sentinels() {
        let sched = vec![
            Stop::new(9, 0, StopKind::VehlOrig, 0, NO_DEADLINE),
            Stop {
                visited_at: Some(12),
                ..Stop::new(7, 3, StopKind::CustDest, 2, 40)
            },
        ];
        let blob = encode_schedule(&sched).unwrap();
        assert_eq!(decode_schedule(&blob).unwrap(), sched);
    }

    #[test]
    fn decode_rejects_foreign_versions() {
        assert!(matches!(decode_route(&[]), Err(BlobError::Empty)));
        assert!(matches!(
            decode_route(&[9, 0, 0]),
            Err(BlobError::UnsupportedVersion(9))
        ));
    }
}
