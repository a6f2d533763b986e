//! # SOCKS v4 / v4a Interpreter
//!
//! Handshake-then-relay decoder. The client sends a single request
//! (`VN CD DSTPORT DSTIP USERID NUL`, with the SOCKS4a domain form when
//! `DSTIP` is `0.0.0.x`, `x != 0`), the server answers with a fixed
//! 8-byte reply, and everything after that is opaque relay traffic.
//!
//! Each handshake side completes independently: the originator is done
//! once its request has been decoded, the responder once its reply has.
//! From then on the interpreter is a pure pass-through producing no
//! events, while the analyzer keeps tracking endpoint completion.
//!
//! ## Gap policy
//!
//! Fatal. The handshake has no resynchronization marker, so a hole
//! inside it ends the session. Once both sides are relaying, gaps carry
//! no decode meaning and are ignored.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::detect::Probe;
use crate::endpoint::Direction;
use crate::event::{EventRecord, FieldValue, Severity, StreamEvent, ViolationEvent};
use crate::interp::{FrameBuffer, GapPolicy, ProtocolInterpreter, ViolationError};

/// Protocol identifier used in events and the registry.
pub const PROTOCOL: &str = "socks";

/// SOCKS protocol version this decoder speaks.
const VERSION: u8 = 4;

/// Reply frames carry version 0.
const REPLY_VERSION: u8 = 0;

/// Fixed reply frame size: VN CD DSTPORT(2) DSTIP(4).
const REPLY_LEN: usize = 8;

/// Shortest possible request: header (8) plus the user-id terminator.
const MIN_REQUEST_LEN: usize = 9;

/// Cap on buffered request bytes (user-id and domain included) before
/// the session is flagged protocol-violating.
const MAX_REQUEST_LEN: usize = 512;

/// Reply status codes defined by SOCKS4.
const STATUS_GRANTED: u8 = 90;
const STATUS_REJECTED_MAX: u8 = 93;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Request command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocksCommand {
    /// Establish a TCP connection to the destination.
    Connect,
    /// Bind a listening port for an inbound connection.
    Bind,
}

impl SocksCommand {
    fn label(self) -> &'static str {
        match self {
            SocksCommand::Connect => "connect",
            SocksCommand::Bind => "bind",
        }
    }
}

/// Handshake events produced by the SOCKS decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SocksEvent {
    /// The client's connect/bind request.
    Request {
        /// Requested operation.
        command: SocksCommand,
        /// Destination port.
        port: u16,
        /// Destination address; `None` for the SOCKS4a domain form.
        addr: Option<Ipv4Addr>,
        /// User-id string from the request.
        user: String,
        /// Destination hostname in the SOCKS4a form.
        domain: Option<String>,
    },
    /// The server's reply.
    Reply {
        /// Whether the request was granted (status 90).
        granted: bool,
        /// Raw status code.
        status: u8,
        /// Bound port echoed by the server.
        port: u16,
        /// Bound address echoed by the server.
        addr: Ipv4Addr,
    },
}

impl SocksEvent {
    /// Flatten into the generic record form.
    pub fn record(&self) -> EventRecord {
        match self {
            SocksEvent::Request {
                command,
                port,
                addr,
                user,
                domain,
            } => EventRecord {
                protocol: PROTOCOL,
                name: "request",
                fields: vec![
                    (
                        "command",
                        Some(FieldValue::Enum(command.label().to_string())),
                    ),
                    ("port", Some(FieldValue::Port(*port))),
                    ("addr", addr.map(|a| FieldValue::Addr(a.into()))),
                    ("user", Some(FieldValue::Str(user.clone()))),
                    ("domain", domain.clone().map(FieldValue::Str)),
                ],
            },
            SocksEvent::Reply {
                granted,
                status,
                port,
                addr,
            } => EventRecord {
                protocol: PROTOCOL,
                name: "reply",
                fields: vec![
                    ("granted", Some(FieldValue::Bool(*granted))),
                    ("status", Some(FieldValue::Count(u64::from(*status)))),
                    ("port", Some(FieldValue::Port(*port))),
                    ("addr", Some(FieldValue::Addr((*addr).into()))),
                ],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Handshake progress, derived from which sides have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksPhase {
    /// No request decoded yet.
    AwaitingRequest,
    /// Request decoded, reply outstanding.
    AwaitingReply,
    /// Both handshake sides done; traffic is opaque relay.
    Relaying,
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

enum RequestParse {
    /// Not enough bytes yet.
    Incomplete,
    /// Structurally wrong; no recovery inside a handshake.
    Bad(&'static str),
    /// Fully decoded request.
    Done(SocksEvent),
}

fn parse_request(buf: &[u8]) -> RequestParse {
    if buf.is_empty() {
        return RequestParse::Incomplete;
    }
    if buf[0] != VERSION {
        return RequestParse::Bad("request version is not 4");
    }
    if buf.len() < 2 {
        return RequestParse::Incomplete;
    }
    let command = match buf[1] {
        1 => SocksCommand::Connect,
        2 => SocksCommand::Bind,
        _ => return RequestParse::Bad("unknown request command"),
    };
    if buf.len() < MIN_REQUEST_LEN {
        return RequestParse::Incomplete;
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = [buf[4], buf[5], buf[6], buf[7]];

    let user_end = match buf[8..].iter().position(|&b| b == 0) {
        Some(pos) => 8 + pos,
        None => return RequestParse::Incomplete,
    };
    let user = String::from_utf8_lossy(&buf[8..user_end]).into_owned();

    // SOCKS4a: 0.0.0.x with x != 0 means a NUL-terminated hostname
    // follows the user-id.
    let is_4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
    if is_4a {
        let rest = &buf[user_end + 1..];
        let domain_end = match rest.iter().position(|&b| b == 0) {
            Some(pos) => pos,
            None => return RequestParse::Incomplete,
        };
        let domain = String::from_utf8_lossy(&rest[..domain_end]).into_owned();
        RequestParse::Done(SocksEvent::Request {
            command,
            port,
            addr: None,
            user,
            domain: Some(domain),
        })
    } else {
        RequestParse::Done(SocksEvent::Request {
            command,
            port,
            addr: Some(Ipv4Addr::from(ip)),
            user,
            domain: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

/// SOCKS v4/4a stream decoder for one connection.
pub struct SocksInterpreter {
    request_buf: FrameBuffer,
    reply_buf: FrameBuffer,
    orig_done: bool,
    resp_done: bool,
}

impl SocksInterpreter {
    /// Fresh decoder awaiting the client request.
    pub fn new() -> Self {
        Self {
            request_buf: FrameBuffer::new(MAX_REQUEST_LEN),
            reply_buf: FrameBuffer::new(REPLY_LEN),
            orig_done: false,
            resp_done: false,
        }
    }

    /// Current handshake phase.
    pub fn phase(&self) -> SocksPhase {
        match (self.orig_done, self.resp_done) {
            (false, _) => SocksPhase::AwaitingRequest,
            (true, false) => SocksPhase::AwaitingReply,
            (true, true) => SocksPhase::Relaying,
        }
    }

    fn consume_request(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, ViolationError> {
        // Buffer only up to the request cap; a request that decodes
        // within the cap makes everything after it relay payload, no
        // matter how the delivery was chunked.
        let wanted = MAX_REQUEST_LEN.saturating_sub(self.request_buf.len());
        let take = wanted.min(bytes.len());
        if self.request_buf.extend(&bytes[..take]).is_err() {
            return Err(ViolationError::BufferExhausted {
                protocol: PROTOCOL,
                held: self.request_buf.len() + take,
                limit: MAX_REQUEST_LEN,
            });
        }
        match parse_request(self.request_buf.bytes()) {
            RequestParse::Incomplete => {
                if take < bytes.len() {
                    // The cap is full and the request still has no end.
                    return Err(ViolationError::BufferExhausted {
                        protocol: PROTOCOL,
                        held: self.request_buf.len() + (bytes.len() - take),
                        limit: MAX_REQUEST_LEN,
                    });
                }
                Ok(Vec::new())
            }
            RequestParse::Bad(reason) => Err(ViolationError::Malformed {
                protocol: PROTOCOL,
                reason: reason.to_string(),
            }),
            RequestParse::Done(event) => {
                self.orig_done = true;
                // Anything past the request is early relay payload.
                self.request_buf.clear();
                Ok(vec![StreamEvent::Socks(event)])
            }
        }
    }

    fn consume_reply(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, ViolationError> {
        // Buffer only up to the fixed reply size; the rest is relay.
        let wanted = REPLY_LEN.saturating_sub(self.reply_buf.len());
        let take = wanted.min(bytes.len());
        if self.reply_buf.extend(&bytes[..take]).is_err() {
            return Err(ViolationError::BufferExhausted {
                protocol: PROTOCOL,
                held: self.reply_buf.len() + take,
                limit: REPLY_LEN,
            });
        }
        if self.reply_buf.len() < REPLY_LEN {
            return Ok(Vec::new());
        }

        let frame = self.reply_buf.bytes().to_vec();
        self.reply_buf.clear();
        if frame[0] != REPLY_VERSION {
            return Err(ViolationError::Malformed {
                protocol: PROTOCOL,
                reason: "reply version is not 0".to_string(),
            });
        }
        let status = frame[1];
        let port = u16::from_be_bytes([frame[2], frame[3]]);
        let addr = Ipv4Addr::new(frame[4], frame[5], frame[6], frame[7]);

        let mut events = Vec::new();
        if !(STATUS_GRANTED..=STATUS_REJECTED_MAX).contains(&status) {
            events.push(StreamEvent::Violation(ViolationEvent {
                protocol: PROTOCOL,
                severity: Severity::Recoverable,
                direction: Some(Direction::Responder),
                reason: format!("reply status {status} outside 90..=93"),
            }));
        }
        events.push(StreamEvent::Socks(SocksEvent::Reply {
            granted: status == STATUS_GRANTED,
            status,
            port,
            addr,
        }));
        self.resp_done = true;
        Ok(events)
    }
}

impl Default for SocksInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolInterpreter for SocksInterpreter {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL
    }

    fn gap_policy(&self) -> GapPolicy {
        GapPolicy::Fatal
    }

    fn consume(
        &mut self,
        direction: Direction,
        bytes: &[u8],
    ) -> Result<Vec<StreamEvent>, ViolationError> {
        match direction {
            Direction::Originator if !self.orig_done => self.consume_request(bytes),
            Direction::Responder if !self.resp_done => self.consume_reply(bytes),
            // Relay traffic: pass through, no buffering, no events.
            _ => Ok(Vec::new()),
        }
    }

    fn consume_gap(
        &mut self,
        direction: Direction,
        len: u64,
    ) -> Result<Vec<StreamEvent>, ViolationError> {
        let side_done = match direction {
            Direction::Originator => self.orig_done,
            Direction::Responder => self.resp_done,
        };
        if side_done {
            // Holes in relay traffic carry no decode meaning.
            return Ok(Vec::new());
        }
        Err(ViolationError::UnrecoverableGap {
            protocol: PROTOCOL,
            len,
        })
    }

    fn endpoint_done(&self, direction: Direction) -> bool {
        match direction {
            Direction::Originator => self.orig_done,
            Direction::Responder => self.resp_done,
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        self.request_buf.clear();
        self.reply_buf.clear();
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Recognition probe
// ---------------------------------------------------------------------------

/// Structural check for the identification layer: does the originator
/// prefix look like a SOCKS4 request?
pub fn probe(orig: &[u8], _resp: &[u8]) -> Probe {
    match parse_request(orig) {
        RequestParse::Done(_) => Probe::Match,
        RequestParse::Bad(_) => Probe::NoMatch,
        RequestParse::Incomplete => {
            if orig.len() > MAX_REQUEST_LEN {
                Probe::NoMatch
            } else {
                Probe::NeedMore
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes() -> Vec<u8> {
        // CONNECT 93.184.216.34:443, user "fred".
        let mut req = vec![4, 1, 0x01, 0xBB, 93, 184, 216, 34];
        req.extend_from_slice(b"fred\0");
        req
    }

    fn reply_bytes(status: u8) -> Vec<u8> {
        vec![0, status, 0x01, 0xBB, 93, 184, 216, 34]
    }

    fn events_of(result: Result<Vec<StreamEvent>, ViolationError>) -> Vec<StreamEvent> {
        result.expect("consume should not be fatal")
    }

    #[test]
    fn test_request_then_reply_completes_handshake() {
        let mut interp = SocksInterpreter::new();
        assert_eq!(interp.phase(), SocksPhase::AwaitingRequest);

        let events = events_of(interp.consume(Direction::Originator, &request_bytes()));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Socks(SocksEvent::Request {
                command,
                port,
                addr,
                user,
                domain,
            }) => {
                assert_eq!(*command, SocksCommand::Connect);
                assert_eq!(*port, 443);
                assert_eq!(*addr, Some(Ipv4Addr::new(93, 184, 216, 34)));
                assert_eq!(user, "fred");
                assert!(domain.is_none());
            }
            other => panic!("expected request event, got {other:?}"),
        }
        assert!(interp.endpoint_done(Direction::Originator));
        assert!(!interp.endpoint_done(Direction::Responder));
        assert_eq!(interp.phase(), SocksPhase::AwaitingReply);

        let events = events_of(interp.consume(Direction::Responder, &reply_bytes(90)));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Socks(SocksEvent::Reply { granted: true, status: 90, .. })
        ));
        assert_eq!(interp.phase(), SocksPhase::Relaying);
    }

    #[test]
    fn test_request_split_across_deliveries() {
        let mut interp = SocksInterpreter::new();
        let req = request_bytes();
        for chunk in req.chunks(3) {
            let events = events_of(interp.consume(Direction::Originator, chunk));
            if interp.endpoint_done(Direction::Originator) {
                assert_eq!(events.len(), 1);
            } else {
                assert!(events.is_empty());
            }
        }
        assert!(interp.endpoint_done(Direction::Originator));
    }

    #[test]
    fn test_socks4a_domain_form() {
        let mut interp = SocksInterpreter::new();
        let mut req = vec![4, 1, 0, 80, 0, 0, 0, 1];
        req.extend_from_slice(b"u\0example.net\0");
        let events = events_of(interp.consume(Direction::Originator, &req));
        match &events[0] {
            StreamEvent::Socks(SocksEvent::Request { addr, domain, .. }) => {
                assert_eq!(*addr, None);
                assert_eq!(domain.as_deref(), Some("example.net"));
            }
            other => panic!("expected request event, got {other:?}"),
        }
    }

    #[test]
    fn test_request_and_relay_in_one_delivery() {
        // The request plus more relay bytes than the request cap in a
        // single chunk decodes the same as a tidy request-only chunk.
        let mut interp = SocksInterpreter::new();
        let mut bytes = request_bytes();
        bytes.extend(std::iter::repeat(0xAB).take(MAX_REQUEST_LEN + 100));
        let events = events_of(interp.consume(Direction::Originator, &bytes));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Socks(SocksEvent::Request { .. })
        ));
        assert!(interp.endpoint_done(Direction::Originator));
        assert!(events_of(interp.consume(Direction::Originator, b"more relay")).is_empty());
    }

    #[test]
    fn test_relay_traffic_produces_no_events() {
        let mut interp = SocksInterpreter::new();
        events_of(interp.consume(Direction::Originator, &request_bytes()));
        events_of(interp.consume(Direction::Responder, &reply_bytes(90)));
        for _ in 0..4 {
            assert!(events_of(interp.consume(Direction::Originator, b"tunnel data")).is_empty());
            assert!(events_of(interp.consume(Direction::Responder, b"tunnel data")).is_empty());
        }
    }

    #[test]
    fn test_bad_version_is_fatal() {
        let mut interp = SocksInterpreter::new();
        let result = interp.consume(Direction::Originator, &[5, 1, 0, 80]);
        assert!(matches!(result, Err(ViolationError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_reply_status_is_recoverable() {
        let mut interp = SocksInterpreter::new();
        events_of(interp.consume(Direction::Originator, &request_bytes()));
        let events = events_of(interp.consume(Direction::Responder, &reply_bytes(42)));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StreamEvent::Violation(v) if v.severity == Severity::Recoverable
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::Socks(SocksEvent::Reply { granted: false, .. })
        ));
    }

    #[test]
    fn test_gap_in_handshake_is_fatal_but_harmless_in_relay() {
        let mut interp = SocksInterpreter::new();
        assert!(matches!(
            interp.consume_gap(Direction::Originator, 4),
            Err(ViolationError::UnrecoverableGap { .. })
        ));

        let mut relayed = SocksInterpreter::new();
        events_of(relayed.consume(Direction::Originator, &request_bytes()));
        events_of(relayed.consume(Direction::Responder, &reply_bytes(90)));
        assert!(relayed.consume_gap(Direction::Originator, 1024).unwrap().is_empty());
        assert!(relayed.consume_gap(Direction::Responder, 1024).unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_user_id_exhausts_buffer() {
        let mut interp = SocksInterpreter::new();
        let mut req = vec![4, 1, 0, 80, 10, 0, 0, 1];
        req.extend(std::iter::repeat(b'x').take(MAX_REQUEST_LEN));
        let result = interp.consume(Direction::Originator, &req);
        assert!(matches!(result, Err(ViolationError::BufferExhausted { .. })));
    }

    #[test]
    fn test_probe_verdicts() {
        assert_eq!(probe(&[], &[]), Probe::NeedMore);
        assert_eq!(probe(&[4], &[]), Probe::NeedMore);
        assert_eq!(probe(&[4, 1, 0, 80], &[]), Probe::NeedMore);
        assert_eq!(probe(&request_bytes(), &[]), Probe::Match);
        assert_eq!(probe(&[5, 0], &[]), Probe::NoMatch);
        assert_eq!(probe(&[4, 9, 0, 0], &[]), Probe::NoMatch);
    }

    #[test]
    fn test_zero_length_consume_is_safe() {
        let mut interp = SocksInterpreter::new();
        assert!(events_of(interp.consume(Direction::Originator, &[])).is_empty());
        assert!(events_of(interp.consume(Direction::Responder, &[])).is_empty());
    }
}
