//! # Content-Based Protocol Identification
//!
//! For connections not dispatched by well-known port, the
//! [`ProtocolDetector`] buffers a bounded prefix of bytes from both
//! directions and evaluates each registered candidate's recognition
//! probe (a cheap structural check, not a full decode) in fixed priority
//! order. The first match wins: a fresh [`Analyzer`] is constructed and
//! the buffered bytes are replayed into it, originator first, before
//! live delivery resumes.
//!
//! The prefix buffer is bounded and released the moment a match is found
//! or the cap is reached. Unrecognized traffic is left undecoded rather
//! than misclassified.

use std::sync::Arc;

use crate::analyzer::{Analyzer, AnalyzerRegistry};
use crate::endpoint::Direction;
use crate::event::EventSink;

/// Default cap on buffered prefix bytes per direction.
pub const DEFAULT_IDENT_LIMIT: usize = 4096;

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Verdict of a recognition probe over the buffered prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The prefix is structurally valid for this protocol.
    Match,
    /// The prefix can never belong to this protocol.
    NoMatch,
    /// Too few bytes to decide either way.
    NeedMore,
}

/// Recognition predicate: given the buffered originator and responder
/// prefixes, decide whether the traffic looks like this protocol.
pub type ProbeFn = fn(orig: &[u8], resp: &[u8]) -> Probe;

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Buffers initial bytes of an unidentified connection and picks a
/// decoder by content.
pub struct ProtocolDetector {
    registry: Arc<AnalyzerRegistry>,
    sink: Arc<dyn EventSink>,
    bufs: [Vec<u8>; 2],
    /// Candidate protocol names still in the running, priority order.
    alive: Vec<&'static str>,
    limit: usize,
    gave_up: bool,
}

impl ProtocolDetector {
    /// Detector over the registry's probe-capable candidates with the
    /// default prefix cap.
    pub fn new(registry: Arc<AnalyzerRegistry>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_limit(registry, sink, DEFAULT_IDENT_LIMIT)
    }

    /// Detector with an explicit per-direction prefix cap.
    pub fn with_limit(
        registry: Arc<AnalyzerRegistry>,
        sink: Arc<dyn EventSink>,
        limit: usize,
    ) -> Self {
        let alive = registry.candidates().map(|r| r.name).collect();
        Self {
            registry,
            sink,
            bufs: [Vec::new(), Vec::new()],
            alive,
            limit,
            gave_up: false,
        }
    }

    /// Whether identification has been abandoned for this connection.
    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    /// Total prefix bytes currently retained across both directions.
    pub fn buffered(&self) -> usize {
        self.bufs[0].len() + self.bufs[1].len()
    }

    /// Buffer a chunk and re-evaluate the candidates. Returns the bound
    /// analyzer, already fed the buffered prefix, on the first match.
    pub fn deliver(&mut self, direction: Direction, bytes: &[u8]) -> Option<Analyzer> {
        if self.gave_up {
            return None;
        }
        self.bufs[direction.index()].extend_from_slice(bytes);

        if let Some(analyzer) = self.evaluate() {
            return Some(analyzer);
        }

        if self.alive.is_empty() || self.bufs[direction.index()].len() > self.limit {
            self.give_up();
        }
        None
    }

    /// A capture gap inside the identification prefix makes structural
    /// probing unreliable; the connection is left unidentified.
    pub fn report_gap(&mut self, direction: Direction, len: u64) {
        if self.gave_up {
            return;
        }
        tracing::debug!(
            dir = direction.label(),
            len,
            "gap during identification, giving up"
        );
        self.give_up();
    }

    // -- internals ---------------------------------------------------------

    fn evaluate(&mut self) -> Option<Analyzer> {
        let orig = &self.bufs[Direction::Originator.index()];
        let resp = &self.bufs[Direction::Responder.index()];

        let mut matched = None;
        self.alive.retain(|name| {
            if matched.is_some() {
                return true;
            }
            let reg = match self.registry.by_name(name) {
                Some(reg) => reg,
                None => return false,
            };
            let probe = match reg.probe {
                Some(probe) => probe,
                None => return false,
            };
            match probe(orig, resp) {
                Probe::Match => {
                    matched = Some(reg.name);
                    true
                }
                Probe::NoMatch => false,
                Probe::NeedMore => true,
            }
        });

        let name = matched?;
        tracing::debug!(protocol = name, "protocol identified by content");
        let reg = self.registry.by_name(name)?;
        let mut analyzer = Analyzer::new(reg.instantiate(), self.sink.clone());
        for dir in Direction::BOTH {
            let buffered = std::mem::take(&mut self.bufs[dir.index()]);
            if !buffered.is_empty() {
                analyzer.deliver(dir, &buffered);
            }
        }
        Some(analyzer)
    }

    fn give_up(&mut self) {
        self.gave_up = true;
        for buf in &mut self.bufs {
            buf.clear();
            buf.shrink_to_fit();
        }
        tracing::debug!("connection left unidentified");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
