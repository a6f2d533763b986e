//! # Semantic Events and Sinks
//!
//! Typed event values produced by protocol interpreters, the wrapper enum
//! the engine routes, and the [`EventSink`] contract for delivering them
//! downstream.
//!
//! Emission is fire-and-forget: a sink must accept events without blocking
//! the emitting call, and sink failures never propagate back into decode
//! logic. The [`ChannelSink`] hands events to a crossbeam channel; the
//! [`CollectSink`] accumulates them in memory for tests.

use std::net::IpAddr;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::conn::ConnRecord;
use crate::endpoint::Direction;
use crate::protocols::modbus::ModbusEvent;
use crate::protocols::socks::SocksEvent;

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A single typed field value carried by an event record.
///
/// The variants mirror the semantic types a structured log sink
/// understands: boolean, integer, counter, port, address/subnet,
/// time/interval/double, string/enum, and ordered sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Count(u64),
    Port(u16),
    Addr(IpAddr),
    Subnet { addr: IpAddr, prefix: u8 },
    Time(f64),
    Interval(f64),
    Double(f64),
    Str(String),
    Enum(String),
    Vector(Vec<FieldValue>),
}

/// A named, typed event record: protocol name, event name, and an ordered
/// list of fields. `None` marks a field that is unset, which is distinct
/// from an empty value such as `Str("")`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Protocol that produced the event (e.g. `"modbus"`).
    pub protocol: &'static str,
    /// Event name within the protocol (e.g. `"request"`).
    pub name: &'static str,
    /// Ordered `(field name, value)` pairs.
    pub fields: Vec<(&'static str, Option<FieldValue>)>,
}

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// How badly a frame failed to match the protocol's expected structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// The offending frame is discarded and the session continues.
    Recoverable,
    /// No further bytes are decoded for this connection.
    Fatal,
}

/// A protocol violation surfaced as an event rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationEvent {
    /// Protocol whose decoder flagged the violation.
    pub protocol: &'static str,
    /// Whether the session survives this violation.
    pub severity: Severity,
    /// Direction the offending bytes arrived on, when known.
    pub direction: Option<Direction>,
    /// Human-readable description of what failed to parse.
    pub reason: String,
}

impl ViolationEvent {
    /// Flatten into the generic record form.
    pub fn record(&self) -> EventRecord {
        EventRecord {
            protocol: self.protocol,
            name: "violation",
            fields: vec![
                (
                    "severity",
                    Some(FieldValue::Enum(
                        match self.severity {
                            Severity::Recoverable => "recoverable",
                            Severity::Fatal => "fatal",
                        }
                        .to_string(),
                    )),
                ),
                (
                    "direction",
                    self.direction
                        .map(|d| FieldValue::Enum(d.label().to_string())),
                ),
                ("reason", Some(FieldValue::Str(self.reason.clone()))),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Any semantic event the engine can emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamEvent {
    /// SOCKS handshake progress.
    Socks(SocksEvent),
    /// Modbus/TCP transaction activity.
    Modbus(ModbusEvent),
    /// A protocol violation, recoverable or fatal.
    Violation(ViolationEvent),
    /// Connection summary emitted at teardown.
    Connection(ConnRecord),
    /// Generic record form, for interpreters implemented outside this
    /// crate.
    Custom(EventRecord),
}

impl StreamEvent {
    /// Flatten into the generic named-record form for log sinks.
    pub fn record(&self) -> EventRecord {
        match self {
            StreamEvent::Socks(e) => e.record(),
            StreamEvent::Modbus(e) => e.record(),
            StreamEvent::Violation(e) => e.record(),
            StreamEvent::Connection(e) => e.record(),
            StreamEvent::Custom(rec) => rec.clone(),
        }
    }

    /// Protocol identifier of the emitting decoder.
    pub fn protocol(&self) -> &'static str {
        self.record().protocol
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives emitted events. Implementations must not block and must
/// tolerate receiving zero events for a given delivery.
pub trait EventSink: Send + Sync {
    /// Accept one event. Failures stay inside the sink.
    fn emit(&self, event: StreamEvent);
}

/// Sink backed by a crossbeam channel. Emission never blocks; if the
/// receiver is gone or a bounded channel is full, the event is dropped.
pub struct ChannelSink {
    tx: Sender<StreamEvent>,
}

impl ChannelSink {
    /// Create an unbounded channel sink and its receiving half.
    pub fn unbounded() -> (Self, Receiver<StreamEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Create a bounded channel sink; events beyond `cap` in flight are
    /// dropped rather than blocking the decoder.
    pub fn bounded(cap: usize) -> (Self, Receiver<StreamEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StreamEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!("event dropped: sink channel unavailable");
        }
    }
}

/// In-memory sink that accumulates events for inspection in tests.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectSink {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything collected so far.
    pub fn take(&self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// True when nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectSink {
    fn emit(&self, event: StreamEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_record_shape() {
        let v = ViolationEvent {
            protocol: "modbus",
            severity: Severity::Recoverable,
            direction: Some(Direction::Responder),
            reason: "orphan response".into(),
        };
        let rec = v.record();
        assert_eq!(rec.protocol, "modbus");
        assert_eq!(rec.name, "violation");
        assert_eq!(rec.fields.len(), 3);
        assert_eq!(rec.fields[0].0, "severity");
    }

    #[test]
    fn test_unset_direction_is_none_not_empty() {
        let v = ViolationEvent {
            protocol: "socks",
            severity: Severity::Fatal,
            direction: None,
            reason: "gap inside handshake".into(),
        };
        let rec = v.record();
        assert_eq!(rec.fields[1].1, None);
    }

    #[test]
    fn test_channel_sink_never_blocks_when_full() {
        let (sink, rx) = ChannelSink::bounded(1);
        let v = StreamEvent::Violation(ViolationEvent {
            protocol: "socks",
            severity: Severity::Recoverable,
            direction: None,
            reason: "x".into(),
        });
        sink.emit(v.clone());
        // Second emit must not block even though the channel is full.
        sink.emit(v);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_collect_sink_take_drains() {
        let sink = CollectSink::new();
        sink.emit(StreamEvent::Violation(ViolationEvent {
            protocol: "modbus",
            severity: Severity::Recoverable,
            direction: None,
            reason: "x".into(),
        }));
        assert_eq!(sink.take().len(), 1);
        assert!(sink.is_empty());
    }
}
