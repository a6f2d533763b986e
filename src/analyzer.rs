//! # Analyzer Lifecycle and Factory Registry
//!
//! The [`Analyzer`] is the per-connection facade binding one protocol
//! interpreter to a connection. It translates stream-feed calls
//! (`deliver`, `report_gap`, `end_of_data`, `finish`) into interpreter
//! calls, keeps the two [`Endpoint`](crate::endpoint::Endpoint) trackers
//! current, and contains decode failures so they never reach the caller
//! as hard errors.
//!
//! ## State machine
//!
//! ```text
//! Active ──both endpoints done──> Finished        (terminal)
//!   │
//!   └──fatal protocol violation──> Terminated     (terminal)
//! ```
//!
//! All non-Active states absorb: late `deliver`/`report_gap` calls are
//! silently dropped so stray transport-layer notifications after
//! completion cannot fault the pipeline.
//!
//! The [`AnalyzerRegistry`] maps protocol identifiers and well-known
//! ports to interpreter factories. It is built once at startup and
//! treated as immutable thereafter.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::detect::{Probe, ProbeFn};
use crate::endpoint::{Direction, Endpoint};
use crate::event::{EventSink, Severity, StreamEvent, ViolationEvent};
use crate::interp::{ProtocolInterpreter, ViolationError};
use crate::protocols::{modbus, socks};

// ---------------------------------------------------------------------------
// Analyzer state
// ---------------------------------------------------------------------------

/// Lifecycle state of an analyzer. `Finished` and `Terminated` are both
/// terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    /// Decoding; deliveries are forwarded to the interpreter.
    Active,
    /// Both endpoints completed (or teardown); finalize has run.
    Finished,
    /// A fatal protocol violation stopped decoding for this connection.
    Terminated,
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Per-connection decoder facade owning exactly one interpreter.
pub struct Analyzer {
    interp: Box<dyn ProtocolInterpreter>,
    endpoints: [Endpoint; 2],
    state: AnalyzerState,
    finalized: bool,
    sink: Arc<dyn EventSink>,
}

impl Analyzer {
    /// Bind an interpreter instance to a connection's event sink.
    pub fn new(interp: Box<dyn ProtocolInterpreter>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            interp,
            endpoints: [Endpoint::new(), Endpoint::new()],
            state: AnalyzerState::Active,
            finalized: false,
            sink,
        }
    }

    /// Protocol identifier of the bound interpreter.
    pub fn protocol(&self) -> &'static str {
        self.interp.protocol_id()
    }

    /// Gap policy the bound interpreter applies for this session.
    pub fn gap_policy(&self) -> crate::interp::GapPolicy {
        self.interp.gap_policy()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AnalyzerState {
        self.state
    }

    /// Per-direction tracker, for inspection.
    pub fn endpoint(&self, direction: Direction) -> &Endpoint {
        &self.endpoints[direction.index()]
    }

    /// Forward `bytes`, contiguous with the previous delivery for
    /// `direction`, to the interpreter. Failures surface only as emitted
    /// violation events; a fatal violation terminates the analyzer.
    pub fn deliver(&mut self, direction: Direction, bytes: &[u8]) {
        if self.state != AnalyzerState::Active {
            tracing::trace!(
                protocol = self.protocol(),
                dir = direction.label(),
                len = bytes.len(),
                "delivery dropped after completion"
            );
            return;
        }
        self.endpoints[direction.index()].advance(bytes.len() as u64);
        match self.interp.consume(direction, bytes) {
            Ok(events) => {
                self.emit_all(events);
                self.absorb_interpreter_completion();
            }
            Err(err) => self.terminate(Some(direction), err),
        }
    }

    /// Inform the interpreter that `len` bytes were skipped at the
    /// current cursor for `direction`. The cursor advances; no data is
    /// supplied.
    pub fn report_gap(&mut self, direction: Direction, len: u64) {
        if self.state != AnalyzerState::Active {
            tracing::trace!(
                protocol = self.protocol(),
                dir = direction.label(),
                len,
                "gap dropped after completion"
            );
            return;
        }
        self.endpoints[direction.index()].note_gap(len);
        match self.interp.consume_gap(direction, len) {
            Ok(events) => {
                self.emit_all(events);
                self.absorb_interpreter_completion();
            }
            Err(err) => self.terminate(Some(direction), err),
        }
    }

    /// Mark one direction complete (transport EOF or explicit
    /// termination). Idempotent; the second completion of the same
    /// direction is a no-op. When both directions are done the analyzer
    /// transitions to Finished and runs finalize exactly once.
    pub fn end_of_data(&mut self, direction: Direction) {
        self.mark_done(direction);
    }

    /// Connection-teardown termination regardless of per-direction
    /// completion. Idempotent; runs finalize if it has not run yet and
    /// releases interpreter buffers immediately.
    pub fn finish(&mut self) {
        for ep in &mut self.endpoints {
            ep.mark_done();
        }
        if self.state == AnalyzerState::Active {
            self.state = AnalyzerState::Finished;
            tracing::debug!(protocol = self.protocol(), "analyzer finished (teardown)");
        }
        self.finalize();
    }

    // -- internals ---------------------------------------------------------

    fn mark_done(&mut self, direction: Direction) {
        if self.endpoints[direction.index()].mark_done() {
            tracing::debug!(
                protocol = self.protocol(),
                dir = direction.label(),
                "endpoint done"
            );
        }
        let both_done = self.endpoints.iter().all(Endpoint::is_done);
        if both_done && self.state == AnalyzerState::Active {
            self.state = AnalyzerState::Finished;
            tracing::debug!(protocol = self.protocol(), "analyzer finished");
            self.finalize();
        }
    }

    /// Fold interpreter-declared early completion into endpoint state.
    fn absorb_interpreter_completion(&mut self) {
        for dir in Direction::BOTH {
            if self.state == AnalyzerState::Active && self.interp.endpoint_done(dir) {
                self.mark_done(dir);
            }
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let events = self.interp.finish();
        self.emit_all(events);
    }

    fn terminate(&mut self, direction: Option<Direction>, err: ViolationError) {
        tracing::warn!(
            protocol = self.protocol(),
            error = %err,
            "fatal protocol violation, analyzer terminated"
        );
        self.sink.emit(StreamEvent::Violation(ViolationEvent {
            protocol: err.protocol(),
            severity: Severity::Fatal,
            direction,
            reason: err.to_string(),
        }));
        self.state = AnalyzerState::Terminated;
        // Buffers are released; any final events are discarded because
        // decode stopped mid-session.
        self.finalized = true;
        let _ = self.interp.finish();
    }

    fn emit_all(&self, events: Vec<StreamEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Constructor for a fresh interpreter instance.
pub type InterpreterFactory = Arc<dyn Fn() -> Box<dyn ProtocolInterpreter> + Send + Sync>;

/// One registered protocol: identifier, well-known ports, optional
/// content probe, and the interpreter factory.
pub struct Registration {
    /// Stable protocol identifier.
    pub name: &'static str,
    /// Ports dispatched to this protocol without content inspection.
    pub ports: Vec<u16>,
    /// Cheap structural recognizer for identification by content.
    pub probe: Option<ProbeFn>,
    factory: InterpreterFactory,
}

impl Registration {
    /// Build a fresh interpreter for a new connection.
    pub fn instantiate(&self) -> Box<dyn ProtocolInterpreter> {
        (self.factory)()
    }
}

/// Registry construction failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("protocol {0:?} registered twice")]
    DuplicateName(&'static str),
    #[error("port {port} claimed by both {first:?} and {second:?}")]
    DuplicatePort {
        port: u16,
        first: &'static str,
        second: &'static str,
    },
}

/// Immutable mapping from protocol identifier / well-known port to
/// interpreter factory, plus the priority-ordered candidate list for
/// content-based identification.
pub struct AnalyzerRegistry {
    entries: Vec<Registration>,
    by_name: HashMap<&'static str, usize>,
    by_port: HashMap<u16, usize>,
}

impl AnalyzerRegistry {
    /// Start an empty registry builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: Vec::new(),
        }
    }

    /// The stock registry: SOCKS v4 on 1080 and Modbus/TCP on 502, both
    /// with content probes, in that priority order.
    pub fn standard() -> Self {
        let mut builder = Self::builder();
        builder.entries.push(Registration {
            name: "socks",
            ports: vec![1080],
            probe: Some(socks::probe),
            factory: Arc::new(|| Box::new(socks::SocksInterpreter::new())),
        });
        builder.entries.push(Registration {
            name: "modbus",
            ports: vec![502],
            probe: Some(modbus::probe),
            factory: Arc::new(|| Box::new(modbus::ModbusInterpreter::new())),
        });
        match builder.build() {
            Ok(registry) => registry,
            // The stock set has no duplicate names or ports.
            Err(_) => unreachable!("stock registry is conflict-free"),
        }
    }

    /// Look up a registration by protocol identifier.
    pub fn by_name(&self, name: &str) -> Option<&Registration> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Look up the registration claiming a well-known port.
    pub fn by_port(&self, port: u16) -> Option<&Registration> {
        self.by_port.get(&port).map(|&i| &self.entries[i])
    }

    /// Identification candidates in registration (priority) order.
    pub fn candidates(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter().filter(|r| r.probe.is_some())
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`AnalyzerRegistry`]; registration order fixes probe
/// priority.
pub struct RegistryBuilder {
    entries: Vec<Registration>,
}

impl RegistryBuilder {
    /// Register a protocol with its well-known ports, optional content
    /// probe, and interpreter factory.
    pub fn register<F>(
        mut self,
        name: &'static str,
        ports: &[u16],
        probe: Option<ProbeFn>,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn ProtocolInterpreter> + Send + Sync + 'static,
    {
        self.entries.push(Registration {
            name,
            ports: ports.to_vec(),
            probe,
            factory: Arc::new(factory),
        });
        self
    }

    /// Freeze the registry. Fails on duplicate names or contested ports.
    pub fn build(self) -> Result<AnalyzerRegistry, RegistryError> {
        let mut by_name = HashMap::new();
        let mut by_port: HashMap<u16, usize> = HashMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if by_name.insert(entry.name, idx).is_some() {
                return Err(RegistryError::DuplicateName(entry.name));
            }
            for &port in &entry.ports {
                if let Some(&prev) = by_port.get(&port) {
                    return Err(RegistryError::DuplicatePort {
                        port,
                        first: self.entries[prev].name,
                        second: entry.name,
                    });
                }
                by_port.insert(port, idx);
            }
        }
        Ok(AnalyzerRegistry {
            entries: self.entries,
            by_name,
            by_port,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
