//! # Strata - Layered Stream I/O
//!
//! `strata` is a stream-I/O abstraction library: it composes a **transport**
//! (TCP, UDP, a pty, a serial line - the "lower layer") with an optional
//! **filter** (TLS-like record protection, telnet-like option negotiation)
//! and presents a single uniform [`Stream`] to application code.
//!
//! The heart of the crate is the base stream engine, which mediates between
//! the transport, the filter, and the application callbacks: it sequences
//! the open handshake, routes bytes in both directions with backpressure,
//! drains buffered bytes before disconnecting, retries handshakes off a
//! timer, and keeps everything alive exactly as long as a callback might
//! still arrive.
//!
//! ## How bytes flow
//!
//! ```text
//!        write()                        read callback
//!           |                               /|\
//!   +-------+-------------------------------+--------+
//!   |       |            Stream             |        |
//!   |      \|/                              |        |
//!   |    +--+-------------------------------+---+    |
//!   |    |           Filter (optional)          |    |
//!   |    |  encode: user bytes -> wire bytes    |    |
//!   |    |  decode: wire bytes -> user bytes    |    |
//!   |    +--+-------------------------------+---+    |
//!   |       |                              /|\       |
//!   +-------+-------------------------------+--------+
//!           | write                         | read callback
//!          \|/                              |
//!   +-------+-------------------------------+--------+
//!   |            Transport (lower layer)             |
//!   +------------------------------------------------+
//! ```
//!
//! Filters never return transformed bytes; they push them into an
//! engine-provided sink and may buffer in either direction. The engine
//! reconciles the transport's read/write callback enables from that
//! buffering state after every operation, which is how backpressure
//! propagates end to end.
//!
//! ## Lifecycle
//!
//! A client stream starts closed. [`Stream::open`] brings up the transport
//! (possibly asynchronously), then drives the filter's connect handshake to
//! completion, then reports the open completion, always from outside the
//! caller's stack. [`Stream::close`] drains filter-buffered wire bytes,
//! runs the filter's disconnect handshake, closes the transport, and
//! reports the close completion. A server stream (one built around an
//! already-accepted transport) is born directly into the handshake phase.
//!
//! Everything is callback-driven and nothing blocks: the engine is handed
//! its timers and deferred-work runners by an injected [`Platform`], so the
//! same engine runs under a scheduler thread (see the `strata-rt` crate),
//! an async executor binding, or a hand-pumped test harness.
//!
//! ## Reentrancy
//!
//! User callbacks are always delivered with the engine's lock released and
//! never from inside a transport or filter callback stack. An event handler
//! may therefore call back into its own stream, including `close()` and
//! `release()`, from inside a read callback.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

// ========================================
// Module Declarations
// ========================================

/// The error vocabulary and async-progress types.
pub(crate) mod error;

/// The filter contract: encode/decode layers with handshakes.
pub mod filter;

/// The injected platform: timers and deferred-op runners.
pub mod platform;

/// The base stream engine.
pub(crate) mod stream;

/// The transport contract: the lower layer beneath a stream.
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

// ========================================
// Public Exports
// ========================================

/// Stable error vocabulary plus async-progress outcomes.
pub use error::{Error, FilterProgress, Progress};

/// Filter contract types.
pub use filter::{DataSink, Filter, FilterEvents};

/// Platform contract types.
pub use platform::{Platform, Runner, RunnerHandler, Timer, TimerHandler};

/// The stream engine and its user-facing callback contract.
pub use stream::{Stream, StreamCloseDone, StreamEvents, StreamOpenDone};

/// Transport contract types.
pub use transport::{CloseDone, OpenDone, Transport, TransportEvents};
