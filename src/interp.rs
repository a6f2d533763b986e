//! # Protocol Interpreter Framework
//!
//! The generic contract every protocol-specific decoder implements, plus
//! the shared [`FrameBuffer`] used to assemble frames from partial
//! deliveries and capture gaps.
//!
//! An interpreter is driven exclusively by its owning
//! [`Analyzer`](crate::analyzer::Analyzer): `consume` with real bytes,
//! `consume_gap` with the length of a skipped range, and `finish` at
//! session end. Decoding must be deterministic with respect to the
//! interleaving of those calls: replaying the same sequence always yields
//! the same events.

use thiserror::Error;

use crate::endpoint::Direction;
use crate::event::StreamEvent;

/// Default cap on partial-frame buffering before the frame length is
/// known. Exceeding it without finding a frame boundary is a fatal
/// protocol violation.
pub const DEFAULT_FRAME_LIMIT: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Gap policy
// ---------------------------------------------------------------------------

/// What an interpreter does when the stream has a hole in it. Each
/// protocol applies exactly one policy per session and advertises it
/// through [`ProtocolInterpreter::gap_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
    /// Discard the partial frame and resynchronize at the next
    /// recoverable marker once real data resumes.
    AbandonFrame,
    /// Count the gap toward an already-known frame length without
    /// buffering data; decode fires once gap plus real bytes cover the
    /// frame.
    AdvanceExpected,
    /// No safe resynchronization point exists; a gap terminates the
    /// session.
    Fatal,
}

// ---------------------------------------------------------------------------
// Fatal violations
// ---------------------------------------------------------------------------

/// A protocol violation severe enough to stop decoding the connection.
///
/// Recoverable violations are *events* in a `consume` result, not errors;
/// only conditions with no safe continuation surface as `Err`.
#[derive(Debug, Error)]
pub enum ViolationError {
    /// The partial-frame buffer hit its cap without a frame boundary.
    #[error("{protocol}: {held} buffered bytes exceed the {limit}-byte frame limit without a frame boundary")]
    BufferExhausted {
        protocol: &'static str,
        held: usize,
        limit: usize,
    },

    /// A gap landed where the decoder cannot resynchronize.
    #[error("{protocol}: {len}-byte gap with no resynchronization point")]
    UnrecoverableGap { protocol: &'static str, len: u64 },

    /// Frame content that leaves no safe way to continue the session.
    #[error("{protocol}: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },
}

impl ViolationError {
    /// Protocol identifier of the failing decoder.
    pub fn protocol(&self) -> &'static str {
        match self {
            ViolationError::BufferExhausted { protocol, .. }
            | ViolationError::UnrecoverableGap { protocol, .. }
            | ViolationError::Malformed { protocol, .. } => protocol,
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter contract
// ---------------------------------------------------------------------------

/// A protocol-specific decoder for one connection.
///
/// Implementations maintain frame-assembly state per direction and
/// whatever session state the protocol needs (handshake phase, pending
/// transaction table). They never perform I/O and never block.
pub trait ProtocolInterpreter: Send {
    /// Stable protocol identifier (e.g. `"socks"`).
    fn protocol_id(&self) -> &'static str;

    /// The single gap policy this session applies.
    fn gap_policy(&self) -> GapPolicy;

    /// Append `bytes` to the partial-frame state for `direction`, decode
    /// every complete frame, and return the events produced. Must be safe
    /// to call with zero-length input. Recoverable violations appear as
    /// events in the `Ok` list; `Err` is reserved for fatal failures.
    fn consume(
        &mut self,
        direction: Direction,
        bytes: &[u8],
    ) -> Result<Vec<StreamEvent>, ViolationError>;

    /// Fold a hole of `len` bytes at the current stream position for
    /// `direction` into frame assembly, per [`Self::gap_policy`].
    fn consume_gap(
        &mut self,
        direction: Direction,
        len: u64,
    ) -> Result<Vec<StreamEvent>, ViolationError>;

    /// Whether the interpreter has declared this direction logically
    /// complete ahead of transport EOF (e.g. a handshake side that has
    /// said everything it will say).
    fn endpoint_done(&self, _direction: Direction) -> bool {
        false
    }

    /// Session end: release buffered state immediately and return any
    /// final events. Called exactly once by the analyzer.
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Frame buffer
// ---------------------------------------------------------------------------

/// Partial-frame assembly for one direction of one session.
///
/// Holds bytes for the frame currently being assembled. Before the frame
/// length is known the buffer may grow up to `limit`; once the length is
/// known it never holds more than one frame's worth of bytes. Gap bytes
/// counted via [`note_gap`](Self::note_gap) advance completion without
/// occupying the buffer.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    need: Option<usize>,
    gap_debt: usize,
    limit: usize,
}

impl FrameBuffer {
    /// Empty buffer with the given pre-length cap.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            need: None,
            gap_debt: 0,
            limit,
        }
    }

    /// Bytes currently buffered for the frame under assembly.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered and no frame is pending.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.need.is_none()
    }

    /// The buffered bytes themselves.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total length of the frame under assembly, if known.
    pub fn need(&self) -> Option<usize> {
        self.need
    }

    /// Gap bytes already counted toward the current frame.
    pub fn gap_debt(&self) -> usize {
        self.gap_debt
    }

    /// Append delivered bytes. Fails when the frame length is still
    /// unknown and the buffer would exceed its cap.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), usize> {
        if self.need.is_none() && self.buf.len() + bytes.len() > self.limit {
            return Err(self.buf.len() + bytes.len());
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Record the total frame length once the header has revealed it.
    pub fn set_need(&mut self, total: usize) {
        self.need = Some(total);
    }

    /// Bytes still missing before the current frame is complete, if the
    /// frame length is known.
    pub fn remaining(&self) -> Option<usize> {
        self.need
            .map(|n| n.saturating_sub(self.buf.len() + self.gap_debt))
    }

    /// Count `len` gap bytes toward the current frame without buffering
    /// data. Only meaningful once the frame length is known.
    pub fn note_gap(&mut self, len: usize) {
        self.gap_debt += len;
    }

    /// True once buffered bytes plus gap debt cover the whole frame.
    pub fn is_complete(&self) -> bool {
        matches!(self.remaining(), Some(0))
    }

    /// Remove and return the current frame's delivered bytes, resetting
    /// length and gap state. Bytes beyond the frame stay buffered for the
    /// next one. The returned slice may be shorter than the frame length
    /// when gaps covered part of it.
    pub fn take_frame(&mut self) -> Vec<u8> {
        let need = self.need.take().unwrap_or(self.buf.len());
        let held = need.saturating_sub(self.gap_debt).min(self.buf.len());
        self.gap_debt = 0;
        let rest = self.buf.split_off(held);
        std::mem::replace(&mut self.buf, rest)
    }

    /// Drop the partial frame entirely (abandon-and-resynchronize, or
    /// session teardown).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.shrink_to_fit();
        self.need = None;
        self.gap_debt = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_within_limit() {
        let mut fb = FrameBuffer::new(8);
        assert!(fb.extend(b"abcd").is_ok());
        assert_eq!(fb.len(), 4);
    }

    #[test]
    fn test_extend_over_limit_without_length() {
        let mut fb = FrameBuffer::new(4);
        assert!(fb.extend(b"abc").is_ok());
        assert_eq!(fb.extend(b"de"), Err(5));
    }

    #[test]
    fn test_limit_not_enforced_once_length_known() {
        let mut fb = FrameBuffer::new(4);
        fb.extend(b"ab").unwrap();
        fb.set_need(10);
        assert!(fb.extend(b"cdefghij").is_ok());
        assert!(fb.is_complete());
    }

    #[test]
    fn test_take_frame_leaves_next_frame_bytes() {
        let mut fb = FrameBuffer::new(64);
        fb.extend(b"frame1next").unwrap();
        fb.set_need(6);
        assert!(fb.is_complete());
        assert_eq!(fb.take_frame(), b"frame1");
        assert_eq!(fb.bytes(), b"next");
        assert_eq!(fb.need(), None);
    }

    #[test]
    fn test_gap_debt_completes_frame() {
        let mut fb = FrameBuffer::new(64);
        fb.extend(b"head").unwrap();
        fb.set_need(10);
        assert_eq!(fb.remaining(), Some(6));
        fb.note_gap(4);
        assert_eq!(fb.remaining(), Some(2));
        fb.extend(b"tl").unwrap();
        assert!(fb.is_complete());
        // Only the delivered bytes come back; the gapped region is gone.
        assert_eq!(fb.take_frame(), b"headtl");
        assert!(fb.is_empty());
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut fb = FrameBuffer::new(64);
        fb.extend(b"partial").unwrap();
        fb.set_need(100);
        fb.note_gap(3);
        fb.clear();
        assert!(fb.is_empty());
        assert_eq!(fb.gap_debt(), 0);
        assert_eq!(fb.remaining(), None);
    }
}
