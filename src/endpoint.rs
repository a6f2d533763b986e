//! # Endpoint State Tracking
//!
//! Per-direction bookkeeping for one connection: a monotonically advancing
//! consumed-byte cursor, a `done` flag that is set at most once, and gap
//! accounting for byte ranges the capture never delivered.
//!
//! The [`Analyzer`](crate::analyzer::Analyzer) consults and updates one
//! [`Endpoint`] per direction on every delivery and on every half-close.
//! Connection-level completion requires *both* endpoints to be done, even
//! when one direction's decoder logically finished earlier.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Stream direction relative to the connection originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Bytes sent by the connection originator (client side).
    Originator,
    /// Bytes sent by the responder (server side).
    Responder,
}

impl Direction {
    /// Both directions, originator first. Useful for replay ordering.
    pub const BOTH: [Direction; 2] = [Direction::Originator, Direction::Responder];

    /// Array index for per-direction state pairs.
    pub fn index(self) -> usize {
        match self {
            Direction::Originator => 0,
            Direction::Responder => 1,
        }
    }

    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::Originator => Direction::Responder,
            Direction::Responder => Direction::Originator,
        }
    }

    /// Short label used in logs and records.
    pub fn label(self) -> &'static str {
        match self {
            Direction::Originator => "orig",
            Direction::Responder => "resp",
        }
    }
}

// ---------------------------------------------------------------------------
// Gap
// ---------------------------------------------------------------------------

/// A half-open byte range `[start, end)` within one direction's stream that
/// was never delivered. Bytes inside a gap are unknown to the decoder,
/// never zero-filled or inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// First missing stream offset.
    pub start: u64,
    /// One past the last missing stream offset.
    pub end: u64,
}

impl Gap {
    /// Number of missing bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True for a degenerate zero-length gap.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Direction-scoped completion and gap bookkeeping.
///
/// Invariants: the cursor never decreases, and `done` transitions from
/// `false` to `true` at most once and is never cleared.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    cursor: u64,
    done: bool,
    gap_count: u64,
    gap_bytes: u64,
}

impl Endpoint {
    /// Fresh endpoint at stream offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current consumed-byte cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether this direction has delivered EOF or been terminated.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of gaps reported on this direction.
    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    /// Total bytes covered by reported gaps.
    pub fn gap_bytes(&self) -> u64 {
        self.gap_bytes
    }

    /// Advance the cursor past `len` delivered bytes.
    pub fn advance(&mut self, len: u64) {
        self.cursor += len;
    }

    /// Record a gap of `len` bytes at the current cursor and advance past
    /// it. Returns the skipped range.
    pub fn note_gap(&mut self, len: u64) -> Gap {
        let gap = Gap {
            start: self.cursor,
            end: self.cursor + len,
        };
        self.cursor = gap.end;
        self.gap_count += 1;
        self.gap_bytes += len;
        gap
    }

    /// Mark this direction complete. Returns `true` only on the first
    /// call; repeated completion is a no-op, not an error.
    pub fn mark_done(&mut self) -> bool {
        if self.done {
            false
        } else {
            self.done = true;
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
