//! # Strand Engine - Application-Layer Stream Analysis
//!
//! Reassembled TCP payload goes in, typed protocol events come out. The
//! engine sits above a transport tracker that reassembles byte streams
//! and normalizes direction; it binds a protocol decoder to each
//! connection, drives the decoder through the connection's lifetime, and
//! emits semantic events plus a summary record at teardown.
//!
//! ## Architecture
//!
//! The engine is structured into several subsystems:
//!
//! - **endpoint**: Per-direction stream cursors, gap accounting, and
//!   completion flags
//! - **analyzer**: Per-connection decoder lifecycle and the protocol
//!   factory registry
//! - **detect**: Content-based protocol identification for traffic on
//!   non-standard ports
//! - **protocols**: Bundled decoders (SOCKS v4/4a, Modbus/TCP)
//! - **conn**: Connection table and teardown summary records
//! - **event**: Typed events and the sink contract
//! - **logsink**: Schema-checked structured log output
//!
//! ## Stream-delivery contract
//!
//! The caller feeds each connection per direction, in stream order:
//! contiguous chunks via [`StreamEngine::deliver`], unrecoverable
//! capture losses via [`StreamEngine::report_gap`], per-direction EOF
//! via [`StreamEngine::end_of_data`], and teardown via
//! [`StreamEngine::finish`]. Decoding behavior depends only on the byte
//! stream, never on how it was chunked.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand_engine::{ChannelSink, ConnTuple, Direction, StreamEngine};
//!
//! let (sink, events) = ChannelSink::unbounded();
//! let engine = StreamEngine::new(Arc::new(sink));
//!
//! let conn = ConnTuple::tcp(
//!     "10.0.0.1".parse().unwrap(), 49000,
//!     "10.0.0.2".parse().unwrap(), 502,
//! );
//! engine.deliver(&conn, Direction::Originator, b"...", 1700000000.0);
//! let summary = engine.finish(&conn, 1700000001.0);
//! println!("{summary:?}");
//! for event in events.try_iter() {
//!     println!("{event:?}");
//! }
//! ```

pub mod analyzer;
pub mod conn;
pub mod detect;
pub mod endpoint;
pub mod event;
pub mod interp;
pub mod logsink;
pub mod protocols;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use analyzer::{Analyzer, AnalyzerRegistry, AnalyzerState, RegistryBuilder};
pub use conn::{Chain, ConnRecord, ConnTuple, Connection, ConnectionTable};
pub use detect::{Probe, ProbeFn, ProtocolDetector};
pub use endpoint::{Direction, Endpoint, Gap};
pub use event::{ChannelSink, CollectSink, EventSink, FieldValue, StreamEvent};
pub use interp::{FrameBuffer, GapPolicy, ProtocolInterpreter, ViolationError};


// ---------------------------------------------------------------------------
// Engine statistics
// ---------------------------------------------------------------------------

/// Cumulative counters for the engine.
#[derive(Debug, Default)]
struct EngineStats {
    connections_tracked: AtomicU64,
    chunks_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    gaps_reported: AtomicU64,
    protocols_identified: AtomicU64,
    analyzers_terminated: AtomicU64,
    connections_finished: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub connections_tracked: u64,
    pub chunks_delivered: u64,
    pub bytes_delivered: u64,
    pub gaps_reported: u64,
    pub protocols_identified: u64,
    pub analyzers_terminated: u64,
    pub connections_finished: u64,
}

// ---------------------------------------------------------------------------
// StreamEngine - the main orchestrator
// ---------------------------------------------------------------------------

/// The stream analysis engine.
///
/// Owns the connection table and the protocol registry, and routes every
/// stream-feed call to the right connection's analyzer chain. Designed to
/// be instantiated once and driven by a transport tracker; calls for
/// distinct connections may come from different threads.
pub struct StreamEngine {
    registry: Arc<AnalyzerRegistry>,
    sink: Arc<dyn EventSink>,
    table: ConnectionTable,
    stats: EngineStats,
}

impl StreamEngine {
    /// Engine over the stock protocol registry.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_registry(Arc::new(AnalyzerRegistry::standard()), sink)
    }

    /// Engine over a caller-built registry.
    pub fn with_registry(registry: Arc<AnalyzerRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            sink,
            table: ConnectionTable::new(),
            stats: EngineStats::default(),
        }
    }

    /// Deliver a chunk contiguous with the previous delivery for
    /// `direction` on this connection. Creates the connection on first
    /// observation: traffic to a registered well-known port binds its
    /// decoder immediately, anything else enters identification.
    pub fn deliver(&self, tuple: &ConnTuple, direction: Direction, bytes: &[u8], ts: f64) {
        self.stats.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_delivered
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        self.table.with_or_insert(
            tuple.clone(),
            || self.open_connection(tuple, ts),
            |conn| {
                conn.note_chunk(direction, bytes.len() as u64, ts);
                let detected = match &mut conn.chain {
                    Chain::Bound(analyzer) => {
                        let was_active = analyzer.state() == AnalyzerState::Active;
                        analyzer.deliver(direction, bytes);
                        self.note_termination(was_active, analyzer);
                        return;
                    }
                    Chain::Detecting(detector) => detector.deliver(direction, bytes),
                    Chain::Unidentified => return,
                };
                self.settle_detection(conn, detected);
            },
        );
    }

    /// Report `len` bytes irrecoverably missing at the current cursor
    /// for `direction`. The stream resumes contiguously after the gap.
    pub fn report_gap(&self, tuple: &ConnTuple, direction: Direction, len: u64, ts: f64) {
        self.stats.gaps_reported.fetch_add(1, Ordering::Relaxed);

        self.table.with_or_insert(
            tuple.clone(),
            || self.open_connection(tuple, ts),
            |conn| {
                conn.note_gap(direction, len, ts);
                match &mut conn.chain {
                    Chain::Bound(analyzer) => {
                        let was_active = analyzer.state() == AnalyzerState::Active;
                        analyzer.report_gap(direction, len);
                        self.note_termination(was_active, analyzer);
                        return;
                    }
                    Chain::Detecting(detector) => detector.report_gap(direction, len),
                    Chain::Unidentified => return,
                }
                self.settle_detection(conn, None);
            },
        );
    }

    /// Per-direction EOF from the transport layer. Idempotent.
    pub fn end_of_data(&self, tuple: &ConnTuple, direction: Direction, ts: f64) {
        self.table.with(tuple, |conn| {
            conn.last_ts = ts;
            if let Chain::Bound(analyzer) = &mut conn.chain {
                analyzer.end_of_data(direction);
            }
        });
    }

    /// Connection teardown: finalize the decoder, emit the connection
    /// summary event, and stop tracking the tuple. Returns the summary,
    /// or `None` for an unknown tuple.
    pub fn finish(&self, tuple: &ConnTuple, ts: f64) -> Option<ConnRecord> {
        let mut conn = self.table.remove(tuple)?;
        conn.last_ts = ts;
        Some(self.close_connection(conn))
    }

    /// Tear down every tracked connection, for engine shutdown. Summary
    /// records are emitted as usual and returned in no particular order.
    pub fn shutdown(&self) -> Vec<ConnRecord> {
        self.table
            .drain()
            .into_iter()
            .map(|conn| self.close_connection(conn))
            .collect()
    }

    /// Number of currently tracked connections.
    pub fn active_connections(&self) -> usize {
        self.table.len()
    }

    /// Copy of the cumulative counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_tracked: self.stats.connections_tracked.load(Ordering::Relaxed),
            chunks_delivered: self.stats.chunks_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.stats.bytes_delivered.load(Ordering::Relaxed),
            gaps_reported: self.stats.gaps_reported.load(Ordering::Relaxed),
            protocols_identified: self.stats.protocols_identified.load(Ordering::Relaxed),
            analyzers_terminated: self.stats.analyzers_terminated.load(Ordering::Relaxed),
            connections_finished: self.stats.connections_finished.load(Ordering::Relaxed),
        }
    }

    // -- internals ---------------------------------------------------------

    fn open_connection(&self, tuple: &ConnTuple, ts: f64) -> Connection {
        self.stats
            .connections_tracked
            .fetch_add(1, Ordering::Relaxed);

        let chain = match self.registry.by_port(tuple.resp_port) {
            Some(reg) => {
                self.stats
                    .protocols_identified
                    .fetch_add(1, Ordering::Relaxed);
                let analyzer = Analyzer::new(reg.instantiate(), self.sink.clone());
                tracing::debug!(
                    conn = %tuple,
                    protocol = reg.name,
                    gap_policy = ?analyzer.gap_policy(),
                    "protocol bound by well-known port"
                );
                Chain::Bound(analyzer)
            }
            None => Chain::Detecting(ProtocolDetector::new(
                self.registry.clone(),
                self.sink.clone(),
            )),
        };
        Connection::new(tuple.clone(), ts, chain)
    }

    /// Settle identification transitions after a feed step: bind a
    /// matched decoder, or stop buffering once identification gave up.
    fn settle_detection(&self, conn: &mut Connection, detected: Option<Analyzer>) {
        if let Some(analyzer) = detected {
            self.stats
                .protocols_identified
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                conn = %conn.tuple,
                protocol = analyzer.protocol(),
                gap_policy = ?analyzer.gap_policy(),
                "protocol bound by content"
            );
            // Prefix replay may already have terminated the decoder.
            self.note_termination(true, &analyzer);
            conn.chain = Chain::Bound(analyzer);
        } else if matches!(&conn.chain, Chain::Detecting(d) if d.gave_up()) {
            conn.chain = Chain::Unidentified;
        }
    }

    fn note_termination(&self, was_active: bool, analyzer: &Analyzer) {
        if was_active && analyzer.state() == AnalyzerState::Terminated {
            self.stats
                .analyzers_terminated
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn close_connection(&self, mut conn: Connection) -> ConnRecord {
        if let Chain::Bound(analyzer) = &mut conn.chain {
            analyzer.finish();
        }
        self.stats
            .connections_finished
            .fetch_add(1, Ordering::Relaxed);

        let record = conn.to_record();
        tracing::debug!(
            uid = %record.uid,
            service = record.service.as_deref().unwrap_or("-"),
            duration = record.duration,
            "connection finished"
        );
        self.sink.emit(StreamEvent::Connection(record.clone()));
        record
    }
}
