//! # Protocol Interpreters
//!
//! Protocol-specific stream decoders. Each module implements the
//! [`ProtocolInterpreter`](crate::interp::ProtocolInterpreter) contract
//! and produces typed events that the analyzer forwards to the event
//! sink.
//!
//! ## Bundled Protocols
//!
//! | Module   | Protocol    | Well-Known Port | Pattern                         | Gap Policy      |
//! |----------|-------------|-----------------|---------------------------------|-----------------|
//! | `socks`  | SOCKS v4/4a | 1080            | handshake-then-relay            | Fatal           |
//! | `modbus` | Modbus/TCP  | 502             | transaction-correlated req/resp | AdvanceExpected |
//!
//! ## Adding a New Protocol
//!
//! 1. Create a new module file `src/protocols/<name>.rs`
//! 2. Declare the module in this file
//! 3. Implement `ProtocolInterpreter` for your decoder struct, choosing
//!    and documenting exactly one gap policy for the session
//! 4. Optionally write a recognition probe (a structural check over the
//!    buffered prefix, not a full decode)
//! 5. Register the factory, ports, and probe in the
//!    [`AnalyzerRegistry`](crate::analyzer::AnalyzerRegistry)

pub mod modbus;
pub mod socks;
