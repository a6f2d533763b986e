//! # Modbus/TCP Interpreter
//!
//! Transaction-correlated request/response decoder. Every frame starts
//! with the 7-byte MBAP header:
//!
//! ```text
//! +----------------+----------------+----------------+------+----------+------
//! | transaction id | protocol id    | length         | unit | function | data
//! | 2 bytes BE     | 2 bytes BE (0) | 2 bytes BE     | 1    | 1        | ...
//! +----------------+----------------+----------------+------+----------+------
//! ```
//!
//! `length` counts the unit id, function code, and data, so a frame's
//! total size is `6 + length`. The interpreter keeps a table of
//! outstanding transaction ids mapped to the requested function code so
//! a response can be validated against what was asked: an orphan
//! response yields a recoverable violation, a mismatched function code
//! yields a distinct mismatch event, and an exception response
//! (`function | 0x80`) yields an exception event carrying the exception
//! code.
//!
//! ## Gap policy
//!
//! AdvanceExpected. The MBAP header reveals the frame extent early;
//! every decoded field lives in the first bytes of the frame, so a gap
//! confined to the register-data region completes the frame with exactly
//! the same event as a full delivery. A gap that swallows a frame
//! boundary, or one that lands before the header and function code have
//! all been delivered, is fatal: the lost bytes would have to be read as
//! fields or the next frame boundary becomes unknowable.

use std::collections::HashMap;

use serde::Serialize;

use crate::detect::Probe;
use crate::endpoint::Direction;
use crate::event::{EventRecord, FieldValue, Severity, StreamEvent, ViolationEvent};
use crate::interp::{FrameBuffer, GapPolicy, ProtocolInterpreter, ViolationError};

/// Protocol identifier used in events and the registry.
pub const PROTOCOL: &str = "modbus";

/// Bytes before the unit id: transaction id, protocol id, length.
const MBAP_PREFIX_LEN: usize = 6;

/// Frame bytes needed to decode every field we report: MBAP header plus
/// the function code.
const DECODE_LEN: usize = 8;

/// Valid range of the MBAP `length` field: unit id + function code at
/// minimum, 252 data bytes at maximum.
const LENGTH_MIN: usize = 2;
const LENGTH_MAX: usize = 254;

/// Exception responses set the high bit of the function code.
const EXCEPTION_FLAG: u8 = 0x80;

/// Outstanding transactions kept before new requests are flagged.
const MAX_PENDING: usize = 1024;

/// Function codes the decoder recognizes (public Modbus function set).
const KNOWN_FUNCTIONS: &[u8] = &[
    1, 2, 3, 4, 5, 6, 7, 8, 11, 12, 15, 16, 17, 20, 21, 22, 23, 24, 43,
];

fn known_function(code: u8) -> bool {
    KNOWN_FUNCTIONS.contains(&code)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Transaction events produced by the Modbus decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ModbusEvent {
    /// A request frame from the originator.
    Request {
        /// Transaction identifier correlating request and response.
        tid: u16,
        /// Addressed unit (slave) identifier.
        unit: u8,
        /// Requested function code.
        function: u8,
        /// Data bytes following the function code.
        data_len: u16,
    },
    /// A response frame matching an outstanding request.
    Response {
        tid: u16,
        unit: u8,
        function: u8,
        data_len: u16,
    },
    /// An exception response (`function | 0x80`) to a matched request.
    Exception {
        tid: u16,
        unit: u8,
        /// The original (un-flagged) function code.
        function: u8,
        /// Modbus exception code from the first data byte.
        code: u8,
    },
    /// A response whose function code disagrees with its matched
    /// request.
    FunctionMismatch {
        tid: u16,
        /// Function code the request asked for.
        expected: u8,
        /// Function code the response carried.
        got: u8,
    },
}

impl ModbusEvent {
    /// Flatten into the generic record form.
    pub fn record(&self) -> EventRecord {
        match self {
            ModbusEvent::Request {
                tid,
                unit,
                function,
                data_len,
            } => EventRecord {
                protocol: PROTOCOL,
                name: "request",
                fields: vec![
                    ("tid", Some(FieldValue::Count(u64::from(*tid)))),
                    ("unit", Some(FieldValue::Count(u64::from(*unit)))),
                    ("function", Some(FieldValue::Count(u64::from(*function)))),
                    ("data_len", Some(FieldValue::Count(u64::from(*data_len)))),
                ],
            },
            ModbusEvent::Response {
                tid,
                unit,
                function,
                data_len,
            } => EventRecord {
                protocol: PROTOCOL,
                name: "response",
                fields: vec![
                    ("tid", Some(FieldValue::Count(u64::from(*tid)))),
                    ("unit", Some(FieldValue::Count(u64::from(*unit)))),
                    ("function", Some(FieldValue::Count(u64::from(*function)))),
                    ("data_len", Some(FieldValue::Count(u64::from(*data_len)))),
                ],
            },
            ModbusEvent::Exception {
                tid,
                unit,
                function,
                code,
            } => EventRecord {
                protocol: PROTOCOL,
                name: "exception",
                fields: vec![
                    ("tid", Some(FieldValue::Count(u64::from(*tid)))),
                    ("unit", Some(FieldValue::Count(u64::from(*unit)))),
                    ("function", Some(FieldValue::Count(u64::from(*function)))),
                    ("code", Some(FieldValue::Count(u64::from(*code)))),
                ],
            },
            ModbusEvent::FunctionMismatch { tid, expected, got } => EventRecord {
                protocol: PROTOCOL,
                name: "function_mismatch",
                fields: vec![
                    ("tid", Some(FieldValue::Count(u64::from(*tid)))),
                    ("expected", Some(FieldValue::Count(u64::from(*expected)))),
                    ("got", Some(FieldValue::Count(u64::from(*got)))),
                ],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// Modbus/TCP stream decoder for one connection.
pub struct ModbusInterpreter {
    bufs: [FrameBuffer; 2],
    /// Outstanding transaction id -> requested function code.
    pending: HashMap<u16, u8>,
}

impl ModbusInterpreter {
    /// Fresh decoder with empty frame buffers and no outstanding
    /// transactions.
    pub fn new() -> Self {
        Self {
            bufs: [
                FrameBuffer::new(LENGTH_MAX + MBAP_PREFIX_LEN),
                FrameBuffer::new(LENGTH_MAX + MBAP_PREFIX_LEN),
            ],
            pending: HashMap::new(),
        }
    }

    /// Number of requests still awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn violation(direction: Direction, reason: String) -> StreamEvent {
        StreamEvent::Violation(ViolationEvent {
            protocol: PROTOCOL,
            severity: Severity::Recoverable,
            direction: Some(direction),
            reason,
        })
    }

    /// Pull every complete frame out of `direction`'s buffer.
    fn drain_frames(&mut self, direction: Direction) -> Result<Vec<StreamEvent>, ViolationError> {
        let mut events = Vec::new();
        loop {
            let buf = &mut self.bufs[direction.index()];
            if buf.need().is_none() {
                if buf.len() < MBAP_PREFIX_LEN {
                    break;
                }
                let header = buf.bytes();
                let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                if !(LENGTH_MIN..=LENGTH_MAX).contains(&length) {
                    return Err(ViolationError::Malformed {
                        protocol: PROTOCOL,
                        reason: format!("implausible MBAP length {length}"),
                    });
                }
                buf.set_need(MBAP_PREFIX_LEN + length);
            }
            if !buf.is_complete() {
                break;
            }
            let frame = buf.take_frame();
            self.decode_frame(direction, &frame, &mut events);
        }
        Ok(events)
    }

    /// Decode one complete frame. `frame` holds only the delivered
    /// bytes; gapped regions are absent and were never inspected.
    fn decode_frame(&mut self, direction: Direction, frame: &[u8], events: &mut Vec<StreamEvent>) {
        if frame.len() < DECODE_LEN {
            events.push(Self::violation(
                direction,
                "frame header lost to capture gap".to_string(),
            ));
            return;
        }
        let tid = u16::from_be_bytes([frame[0], frame[1]]);
        let pid = u16::from_be_bytes([frame[2], frame[3]]);
        let length = u16::from_be_bytes([frame[4], frame[5]]);
        let unit = frame[6];
        let function = frame[7];
        let data_len = length - 2;

        if pid != 0 {
            events.push(Self::violation(
                direction,
                format!("nonzero MBAP protocol id {pid}"),
            ));
            return;
        }

        match direction {
            Direction::Originator => {
                if !known_function(function) {
                    events.push(Self::violation(
                        direction,
                        format!("unknown function code {function} in request"),
                    ));
                    return;
                }
                if self.pending.len() >= MAX_PENDING && !self.pending.contains_key(&tid) {
                    events.push(Self::violation(
                        direction,
                        format!("more than {MAX_PENDING} outstanding transactions"),
                    ));
                    return;
                }
                if self.pending.insert(tid, function).is_some() {
                    events.push(Self::violation(
                        direction,
                        format!("transaction id {tid} reused while outstanding"),
                    ));
                }
                events.push(StreamEvent::Modbus(ModbusEvent::Request {
                    tid,
                    unit,
                    function,
                    data_len,
                }));
            }
            Direction::Responder => {
                let requested = match self.pending.remove(&tid) {
                    Some(fc) => fc,
                    None => {
                        events.push(Self::violation(
                            direction,
                            format!("response for unknown transaction id {tid}"),
                        ));
                        return;
                    }
                };
                if function & EXCEPTION_FLAG != 0 {
                    let base = function & !EXCEPTION_FLAG;
                    if base != requested {
                        events.push(StreamEvent::Modbus(ModbusEvent::FunctionMismatch {
                            tid,
                            expected: requested,
                            got: base,
                        }));
                        return;
                    }
                    let code = match frame.get(DECODE_LEN) {
                        Some(&code) => code,
                        None => {
                            events.push(Self::violation(
                                direction,
                                "exception response without exception code".to_string(),
                            ));
                            return;
                        }
                    };
                    events.push(StreamEvent::Modbus(ModbusEvent::Exception {
                        tid,
                        unit,
                        function: base,
                        code,
                    }));
                } else if function != requested {
                    events.push(StreamEvent::Modbus(ModbusEvent::FunctionMismatch {
                        tid,
                        expected: requested,
                        got: function,
                    }));
                } else {
                    events.push(StreamEvent::Modbus(ModbusEvent::Response {
                        tid,
                        unit,
                        function,
                        data_len,
                    }));
                }
            }
        }
    }
}

impl Default for ModbusInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolInterpreter for ModbusInterpreter {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL
    }

    fn gap_policy(&self) -> GapPolicy {
        GapPolicy::AdvanceExpected
    }

    fn consume(
        &mut self,
        direction: Direction,
        bytes: &[u8],
    ) -> Result<Vec<StreamEvent>, ViolationError> {
        // Feed in slices no larger than the current frame can absorb,
        // draining between slices, so one delivery carrying many frames
        // decodes exactly like the same bytes in small chunks.
        let mut events = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let buf = &mut self.bufs[direction.index()];
            let take = match buf.remaining() {
                Some(remaining) => remaining.max(1).min(rest.len()),
                None => MBAP_PREFIX_LEN
                    .saturating_sub(buf.len())
                    .max(1)
                    .min(rest.len()),
            };
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            if let Err(held) = buf.extend(chunk) {
                return Err(ViolationError::BufferExhausted {
                    protocol: PROTOCOL,
                    held,
                    limit: LENGTH_MAX + MBAP_PREFIX_LEN,
                });
            }
            events.extend(self.drain_frames(direction)?);
        }
        Ok(events)
    }

    fn consume_gap(
        &mut self,
        direction: Direction,
        len: u64,
    ) -> Result<Vec<StreamEvent>, ViolationError> {
        let buf = &mut self.bufs[direction.index()];
        match buf.remaining() {
            // A gap is tolerable only once every decoded field (MBAP
            // header plus function code) has been delivered, and only
            // while it stays inside the current frame. Bytes under the
            // gap are unknown and must never be read as fields.
            Some(remaining) if len as usize <= remaining && buf.len() >= DECODE_LEN => {
                buf.note_gap(len as usize);
                self.drain_frames(direction)
            }
            _ => Err(ViolationError::UnrecoverableGap {
                protocol: PROTOCOL,
                len,
            }),
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.bufs[0].clear();
        self.bufs[1].clear();
        self.pending.clear();
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Recognition probe
// ---------------------------------------------------------------------------

fn probe_side(buf: &[u8]) -> Probe {
    if buf.len() < 4 {
        return Probe::NeedMore;
    }
    if u16::from_be_bytes([buf[2], buf[3]]) != 0 {
        return Probe::NoMatch;
    }
    if buf.len() < DECODE_LEN {
        return Probe::NeedMore;
    }
    let length = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
    if !(LENGTH_MIN..=LENGTH_MAX).contains(&length) {
        return Probe::NoMatch;
    }
    if known_function(buf[7] & !EXCEPTION_FLAG) || known_function(buf[7]) {
        Probe::Match
    } else {
        Probe::NoMatch
    }
}

/// Structural check for the identification layer: does either prefix
/// look like an MBAP-framed message with a recognized function code?
pub fn probe(orig: &[u8], resp: &[u8]) -> Probe {
    if !orig.is_empty() {
        probe_side(orig)
    } else if !resp.is_empty() {
        probe_side(resp)
    } else {
        Probe::NeedMore
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an MBAP frame with the given fields and data payload.
    fn frame(tid: u16, unit: u8, function: u8, data: &[u8]) -> Vec<u8> {
        let length = (2 + data.len()) as u16;
        let mut out = Vec::with_capacity(MBAP_PREFIX_LEN + usize::from(length));
        out.extend_from_slice(&tid.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.push(unit);
        out.push(function);
        out.extend_from_slice(data);
        out
    }

    fn events_of(result: Result<Vec<StreamEvent>, ViolationError>) -> Vec<StreamEvent> {
        result.expect("consume should not be fatal")
    }

    #[test]
    fn test_request_response_roundtrip() {
        let mut interp = ModbusInterpreter::new();
        // Read holding registers: start 0, count 2.
        let req = frame(7, 1, 3, &[0, 0, 0, 2]);
        let events = events_of(interp.consume(Direction::Originator, &req));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Modbus(ModbusEvent::Request { tid: 7, unit: 1, function: 3, data_len: 4 })
        ));
        assert_eq!(interp.outstanding(), 1);

        let resp = frame(7, 1, 3, &[4, 0, 10, 0, 20]);
        let events = events_of(interp.consume(Direction::Responder, &resp));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Modbus(ModbusEvent::Response { tid: 7, function: 3, .. })
        ));
        assert_eq!(interp.outstanding(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_delivery() {
        let mut interp = ModbusInterpreter::new();
        let mut bytes = frame(1, 1, 1, &[0, 0, 0, 8]);
        bytes.extend(frame(2, 1, 2, &[0, 8, 0, 8]));
        let events = events_of(interp.consume(Direction::Originator, &bytes));
        assert_eq!(events.len(), 2);
        assert_eq!(interp.outstanding(), 2);
    }

    #[test]
    fn test_orphan_response_is_recoverable_violation() {
        let mut interp = ModbusInterpreter::new();
        let resp = frame(99, 1, 3, &[2, 0, 5]);
        let events = events_of(interp.consume(Direction::Responder, &resp));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Violation(v)
                if v.severity == Severity::Recoverable && v.reason.contains("99")
        ));
        // The session keeps decoding afterwards.
        let req = frame(1, 1, 3, &[0, 0, 0, 1]);
        assert_eq!(events_of(interp.consume(Direction::Originator, &req)).len(), 1);
    }

    #[test]
    fn test_mismatched_function_code_yields_distinct_event() {
        let mut interp = ModbusInterpreter::new();
        events_of(interp.consume(Direction::Originator, &frame(5, 1, 3, &[0, 0, 0, 1])));
        let events = events_of(interp.consume(Direction::Responder, &frame(5, 1, 4, &[2, 0, 1])));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Modbus(ModbusEvent::FunctionMismatch { tid: 5, expected: 3, got: 4 })
        ));
    }

    #[test]
    fn test_exception_response() {
        let mut interp = ModbusInterpreter::new();
        events_of(interp.consume(Direction::Originator, &frame(9, 1, 3, &[0, 0, 0, 1])));
        // 0x83 = exception to function 3, code 2 (illegal data address).
        let events = events_of(interp.consume(Direction::Responder, &frame(9, 1, 0x83, &[2])));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Modbus(ModbusEvent::Exception { tid: 9, function: 3, code: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_function_code_skips_frame() {
        let mut interp = ModbusInterpreter::new();
        let events = events_of(interp.consume(Direction::Originator, &frame(3, 1, 99, &[0])));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Violation(_)));
        assert_eq!(interp.outstanding(), 0);
    }

    #[test]
    fn test_nonzero_protocol_id_skips_frame() {
        let mut interp = ModbusInterpreter::new();
        let mut bad = frame(1, 1, 3, &[0, 0, 0, 1]);
        bad[2] = 0xDE;
        bad[3] = 0xAD;
        let events = events_of(interp.consume(Direction::Originator, &bad));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Violation(_)));
    }

    #[test]
    fn test_implausible_length_is_fatal() {
        let mut interp = ModbusInterpreter::new();
        let mut bad = frame(1, 1, 3, &[0, 0, 0, 1]);
        bad[4] = 0xFF;
        bad[5] = 0xFF;
        assert!(matches!(
            interp.consume(Direction::Originator, &bad),
            Err(ViolationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_chunked_delivery_matches_single_delivery() {
        let req = frame(11, 2, 16, &[0, 0, 0, 2, 4, 0, 1, 0, 2]);
        let whole = {
            let mut interp = ModbusInterpreter::new();
            events_of(interp.consume(Direction::Originator, &req))
        };
        let chunked = {
            let mut interp = ModbusInterpreter::new();
            let mut events = Vec::new();
            for chunk in req.chunks(1) {
                events.extend(events_of(interp.consume(Direction::Originator, chunk)));
            }
            events
        };
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_many_frames_in_one_large_delivery() {
        // 30 requests, 360 bytes total, well past one frame's worth of
        // buffering. One big delivery must decode exactly like
        // per-frame chunks.
        let mut stream = Vec::new();
        for tid in 0..30u16 {
            stream.extend(frame(tid, 1, 3, &[0, 0, 0, 1]));
        }

        let whole = {
            let mut interp = ModbusInterpreter::new();
            events_of(interp.consume(Direction::Originator, &stream))
        };
        let chunked = {
            let mut interp = ModbusInterpreter::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(12) {
                events.extend(events_of(interp.consume(Direction::Originator, chunk)));
            }
            events
        };
        assert_eq!(whole.len(), 30);
        assert_eq!(whole, chunked);
        assert!(whole
            .iter()
            .all(|e| matches!(e, StreamEvent::Modbus(ModbusEvent::Request { .. }))));
    }

    #[test]
    fn test_gap_over_function_code_is_fatal() {
        // Function code 6, first data byte 3. If the gap over the
        // function code were tolerated, the decoder would read the data
        // byte as the function code and report a write as a read.
        let full = frame(42, 1, 6, &[3, 0, 0, 7]);
        let mut interp = ModbusInterpreter::new();
        // Header and unit id delivered, function code lost.
        assert!(events_of(interp.consume(Direction::Originator, &full[..7])).is_empty());
        assert!(matches!(
            interp.consume_gap(Direction::Originator, 1),
            Err(ViolationError::UnrecoverableGap { .. })
        ));
    }

    #[test]
    fn test_gap_inside_data_region_completes_frame() {
        let data = [0u8; 16];
        let full = frame(21, 1, 3, &data);
        let expected = {
            let mut interp = ModbusInterpreter::new();
            events_of(interp.consume(Direction::Originator, &full))
        };

        let mut interp = ModbusInterpreter::new();
        // Header + function + 4 data bytes, a 10-byte hole, then the
        // last 2 data bytes.
        let mut events = events_of(interp.consume(Direction::Originator, &full[..12]));
        events.extend(events_of(interp.consume_gap(Direction::Originator, 10)));
        events.extend(events_of(interp.consume(Direction::Originator, &full[22..])));
        assert_eq!(events, expected);
    }

    #[test]
    fn test_gap_covering_whole_remainder_completes_frame() {
        let mut interp = ModbusInterpreter::new();
        let full = frame(22, 1, 3, &[0u8; 16]);
        let mut events = events_of(interp.consume(Direction::Originator, &full[..8]));
        events.extend(events_of(interp.consume_gap(Direction::Originator, 16)));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Modbus(ModbusEvent::Request { tid: 22, .. })
        ));
    }

    #[test]
    fn test_gap_past_frame_boundary_is_fatal() {
        let mut interp = ModbusInterpreter::new();
        let full = frame(23, 1, 3, &[0u8; 16]);
        events_of(interp.consume(Direction::Originator, &full[..8]));
        // 16 data bytes remain; a 17-byte gap eats into the next header.
        assert!(matches!(
            interp.consume_gap(Direction::Originator, 17),
            Err(ViolationError::UnrecoverableGap { .. })
        ));
    }

    #[test]
    fn test_gap_before_header_is_fatal() {
        let mut interp = ModbusInterpreter::new();
        assert!(matches!(
            interp.consume_gap(Direction::Originator, 12),
            Err(ViolationError::UnrecoverableGap { .. })
        ));
    }

    #[test]
    fn test_probe_verdicts() {
        assert_eq!(probe(&[], &[]), Probe::NeedMore);
        assert_eq!(probe(&[0, 1], &[]), Probe::NeedMore);
        let req = frame(1, 1, 3, &[0, 0, 0, 1]);
        assert_eq!(probe(&req, &[]), Probe::Match);
        assert_eq!(probe(&[], &req), Probe::Match);
        // Nonzero protocol id can never be Modbus/TCP.
        assert_eq!(probe(&[0, 1, 0xAA, 0xBB], &[]), Probe::NoMatch);
    }

    #[test]
    fn test_zero_length_consume_is_safe() {
        let mut interp = ModbusInterpreter::new();
        assert!(events_of(interp.consume(Direction::Originator, &[])).is_empty());
    }
}
