//! # Connection Layer
//!
//! Per-connection state binding the transport-layer tuple to its
//! analyzer chain, plus the concurrent table the engine keys deliveries
//! by.
//!
//! A connection is created on the first observed delivery and destroyed
//! when the transport layer reports teardown; its analyzer chain lives
//! strictly inside that window. The chain starts either bound to a
//! protocol (well-known port) or in the identification stage, and may
//! end unidentified.
//!
//! Across connections the engine is embarrassingly parallel: the table
//! is a [`DashMap`] keyed by tuple and each connection sits behind its
//! own mutex, so distinct connections never contend.

use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::analyzer::Analyzer;
use crate::detect::ProtocolDetector;
use crate::endpoint::Direction;
use crate::event::{EventRecord, FieldValue};

// ---------------------------------------------------------------------------
// Connection tuple
// ---------------------------------------------------------------------------

/// The 5-tuple identifying one transport session. The transport tracker
/// normalizes direction, so the originator side is fixed at creation.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnTuple {
    pub orig_addr: IpAddr,
    pub orig_port: u16,
    pub resp_addr: IpAddr,
    pub resp_port: u16,
    /// IP protocol number (6 for TCP).
    pub proto: u8,
}

impl ConnTuple {
    /// Convenience constructor for a TCP tuple.
    pub fn tcp(orig_addr: IpAddr, orig_port: u16, resp_addr: IpAddr, resp_port: u16) -> Self {
        Self {
            orig_addr,
            orig_port,
            resp_addr,
            resp_port,
            proto: 6,
        }
    }
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.orig_addr, self.orig_port, self.resp_addr, self.resp_port
        )
    }
}

// ---------------------------------------------------------------------------
// Connection record
// ---------------------------------------------------------------------------

/// Connection summary emitted at teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnRecord {
    /// Unique connection identifier.
    pub uid: String,
    pub orig_addr: IpAddr,
    pub orig_port: u16,
    pub resp_addr: IpAddr,
    pub resp_port: u16,
    /// Identified service, `None` when the connection stayed
    /// unidentified.
    pub service: Option<String>,
    /// Connection start timestamp (Unix epoch seconds).
    pub ts: f64,
    /// Seconds between first and last observed activity.
    pub duration: f64,
    pub orig_bytes: u64,
    pub resp_bytes: u64,
    /// Delivered chunks per direction.
    pub orig_chunks: u64,
    pub resp_chunks: u64,
    /// Bytes lost to capture gaps per direction.
    pub orig_gap_bytes: u64,
    pub resp_gap_bytes: u64,
}

impl ConnRecord {
    /// Flatten into the generic record form. The service field stays
    /// unset (not empty) for unidentified connections.
    pub fn record(&self) -> EventRecord {
        EventRecord {
            protocol: "conn",
            name: "summary",
            fields: vec![
                ("uid", Some(FieldValue::Str(self.uid.clone()))),
                ("orig_addr", Some(FieldValue::Addr(self.orig_addr))),
                ("orig_port", Some(FieldValue::Port(self.orig_port))),
                ("resp_addr", Some(FieldValue::Addr(self.resp_addr))),
                ("resp_port", Some(FieldValue::Port(self.resp_port))),
                ("service", self.service.clone().map(FieldValue::Enum)),
                ("ts", Some(FieldValue::Time(self.ts))),
                ("duration", Some(FieldValue::Interval(self.duration))),
                ("orig_bytes", Some(FieldValue::Count(self.orig_bytes))),
                ("resp_bytes", Some(FieldValue::Count(self.resp_bytes))),
                ("orig_chunks", Some(FieldValue::Count(self.orig_chunks))),
                ("resp_chunks", Some(FieldValue::Count(self.resp_chunks))),
                (
                    "orig_gap_bytes",
                    Some(FieldValue::Count(self.orig_gap_bytes)),
                ),
                (
                    "resp_gap_bytes",
                    Some(FieldValue::Count(self.resp_gap_bytes)),
                ),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Analyzer chain
// ---------------------------------------------------------------------------

/// Where a connection's decoding currently stands.
pub enum Chain {
    /// Buffering a prefix, waiting for a protocol to match.
    Detecting(ProtocolDetector),
    /// A protocol is bound; deliveries flow to its analyzer.
    Bound(Analyzer),
    /// Identification gave up; bytes pass through undecoded.
    Unidentified,
}

impl Chain {
    /// Identified protocol name, if any.
    pub fn service(&self) -> Option<&'static str> {
        match self {
            Chain::Bound(analyzer) => Some(analyzer.protocol()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One tracked connection: tuple, counters, and the analyzer chain.
pub struct Connection {
    pub tuple: ConnTuple,
    pub uid: String,
    pub start_ts: f64,
    pub last_ts: f64,
    bytes: [u64; 2],
    chunks: [u64; 2],
    gap_bytes: [u64; 2],
    pub chain: Chain,
}

impl Connection {
    /// Fresh connection observed at `ts` with its initial chain.
    pub fn new(tuple: ConnTuple, ts: f64, chain: Chain) -> Self {
        Self {
            tuple,
            uid: generate_uid(),
            start_ts: ts,
            last_ts: ts,
            bytes: [0, 0],
            chunks: [0, 0],
            gap_bytes: [0, 0],
            chain,
        }
    }

    /// Account one delivered chunk.
    pub fn note_chunk(&mut self, direction: Direction, len: u64, ts: f64) {
        self.bytes[direction.index()] += len;
        self.chunks[direction.index()] += 1;
        self.last_ts = ts;
    }

    /// Account one reported gap.
    pub fn note_gap(&mut self, direction: Direction, len: u64, ts: f64) {
        self.gap_bytes[direction.index()] += len;
        self.last_ts = ts;
    }

    /// Seconds between first and last observed activity.
    pub fn duration(&self) -> f64 {
        self.last_ts - self.start_ts
    }

    /// Build the teardown summary record.
    pub fn to_record(&self) -> ConnRecord {
        ConnRecord {
            uid: self.uid.clone(),
            orig_addr: self.tuple.orig_addr,
            orig_port: self.tuple.orig_port,
            resp_addr: self.tuple.resp_addr,
            resp_port: self.tuple.resp_port,
            service: self.chain.service().map(str::to_string),
            ts: self.start_ts,
            duration: self.duration(),
            orig_bytes: self.bytes[Direction::Originator.index()],
            resp_bytes: self.bytes[Direction::Responder.index()],
            orig_chunks: self.chunks[Direction::Originator.index()],
            resp_chunks: self.chunks[Direction::Responder.index()],
            orig_gap_bytes: self.gap_bytes[Direction::Originator.index()],
            resp_gap_bytes: self.gap_bytes[Direction::Responder.index()],
        }
    }
}

// ---------------------------------------------------------------------------
// Connection table
// ---------------------------------------------------------------------------

/// Concurrent connection table keyed by tuple. Each connection sits
/// behind its own mutex; the map itself is lock-free for distinct keys.
pub struct ConnectionTable {
    connections: DashMap<ConnTuple, Mutex<Connection>>,
}

impl ConnectionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Run `f` on the connection for `tuple`, creating it with `make`
    /// if this is the first observation.
    pub fn with_or_insert<M, F, R>(&self, tuple: ConnTuple, make: M, f: F) -> R
    where
        M: FnOnce() -> Connection,
        F: FnOnce(&mut Connection) -> R,
    {
        let entry = self
            .connections
            .entry(tuple)
            .or_insert_with(|| Mutex::new(make()));
        let mut conn = entry.lock().unwrap();
        f(&mut conn)
    }

    /// Run `f` on an existing connection, if tracked.
    pub fn with<F, R>(&self, tuple: &ConnTuple, f: F) -> Option<R>
    where
        F: FnOnce(&mut Connection) -> R,
    {
        let entry = self.connections.get(tuple)?;
        let mut conn = entry.lock().unwrap();
        Some(f(&mut conn))
    }

    /// Remove a connection at teardown, returning it for finalization.
    pub fn remove(&self, tuple: &ConnTuple) -> Option<Connection> {
        self.connections
            .remove(tuple)
            .map(|(_, mutex)| mutex.into_inner().unwrap())
    }

    /// Remove and return every tracked connection, for shutdown.
    pub fn drain(&self) -> Vec<Connection> {
        let tuples: Vec<ConnTuple> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tuples
            .into_iter()
            .filter_map(|tuple| self.remove(&tuple))
            .collect()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Generate a unique connection identifier from a timestamp and an
/// atomic counter. Compact alphanumeric form for log correlation.
fn generate_uid() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64;

    format!("S{:x}{:04x}", ts & 0xFFFF_FFFF, count & 0xFFFF)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> ConnTuple {
        ConnTuple::tcp(
            "10.0.0.1".parse().unwrap(),
            40000,
            "10.0.0.2".parse().unwrap(),
            502,
        )
    }

    fn conn() -> Connection {
        Connection::new(tuple(), 1000.0, Chain::Unidentified)
    }

    #[test]
    fn test_counters_and_duration() {
        let mut c = conn();
        c.note_chunk(Direction::Originator, 100, 1001.0);
        c.note_chunk(Direction::Responder, 50, 1002.0);
        c.note_gap(Direction::Responder, 25, 1003.0);
        let rec = c.to_record();
        assert_eq!(rec.orig_bytes, 100);
        assert_eq!(rec.resp_bytes, 50);
        assert_eq!(rec.orig_chunks, 1);
        assert_eq!(rec.resp_gap_bytes, 25);
        assert!((rec.duration - 3.0).abs() < f64::EPSILON);
        assert_eq!(rec.service, None);
    }

    #[test]
    fn test_unidentified_service_is_unset_in_record_form() {
        let rec = conn().to_record().record();
        let service = rec.fields.iter().find(|(n, _)| *n == "service").unwrap();
        assert_eq!(service.1, None);
    }

    #[test]
    fn test_table_insert_with_remove() {
        let table = ConnectionTable::new();
        let uid = table.with_or_insert(tuple(), conn, |c| c.uid.clone());
        assert_eq!(table.len(), 1);
        // Second call reuses the tracked connection.
        let uid2 = table.with_or_insert(tuple(), conn, |c| c.uid.clone());
        assert_eq!(uid, uid2);
        let removed = table.remove(&tuple()).unwrap();
        assert_eq!(removed.uid, uid);
        assert!(table.is_empty());
        assert!(table.with(&tuple(), |_| ()).is_none());
    }

    #[test]
    fn test_uids_are_unique() {
        let a = generate_uid();
        let b = generate_uid();
        assert!(a.starts_with('S'));
        assert_ne!(a, b);
    }
}
