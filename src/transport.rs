//! The transport contract: the lower layer beneath a [`Stream`](crate::Stream).
//!
//! A transport moves raw bytes (TCP, UDP, a pty, a serial line...). The
//! engine owns its transport exclusively, drives its read/write callback
//! enables, and is the only caller of its operations. Events flow back up
//! through [`TransportEvents`], a non-owning handle onto the engine.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Error, Progress};

/// Completion continuation for an asynchronous [`Transport::open`].
pub type OpenDone = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Completion continuation for an asynchronous [`Transport::close`].
pub type CloseDone = Box<dyn FnOnce() + Send>;

/// The lower layer of a stream: a byte transport.
///
/// Implementations are internally synchronized (`&self` operations may be
/// called from engine entry points and platform dispatch contexts alike) and
/// must never invoke a [`TransportEvents`] callback from inside one of their
/// own operations: events are delivered from the transport's own I/O
/// context.
pub trait Transport: Send + Sync {
    /// Register the engine's event handle. Called once, before any other
    /// operation.
    fn set_events(&self, events: Arc<dyn TransportEvents>);

    /// Start connecting.
    ///
    /// Returns `Ok(Progress::Complete)` if the transport is usable now
    /// (`done` is dropped unused), `Ok(Progress::Pending)` if the connect
    /// continues asynchronously (`done` fires exactly once with the result,
    /// from the transport's own context, never from inside this call), or
    /// an error if the connect could not even be started.
    fn open(&self, done: OpenDone) -> Result<Progress, Error>;

    /// Start closing. Never fails: a transport that cannot close gracefully
    /// closes hard. `Progress::Pending` means `done` fires when the close
    /// finishes (from the transport's own context, never inline);
    /// `Progress::Complete` means it is already finished and `done` is
    /// dropped unused.
    ///
    /// Closing while an [`open`](Transport::open) is still pending cancels
    /// the open: the open's continuation is dropped, not invoked.
    fn close(&self, done: CloseDone) -> Progress;

    /// Write bytes, returning how many were accepted. Zero is a valid
    /// result when the transport is flow-controlled.
    fn write(&self, buf: &[u8]) -> Result<usize, Error>;

    /// Allow or suppress [`TransportEvents::read`] delivery.
    fn set_read_enabled(&self, enabled: bool);

    /// Allow or suppress [`TransportEvents::write_ready`] delivery.
    fn set_write_enabled(&self, enabled: bool);

    /// Human-readable remote endpoint description.
    fn remote_addr_str(&self) -> String;

    /// Remote socket address, when the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Transport-specific remote identifier (e.g. a pty child pid), when the
    /// transport has one.
    fn remote_id(&self) -> Option<i64> {
        None
    }

    /// The engine is done with this transport; release its resources. Called
    /// exactly once, after which no other operation is invoked.
    fn free(&self);
}

/// Engine-side callbacks a transport delivers events into.
///
/// The handle a transport receives is a weak dispatch onto the engine: it
/// stays valid for as long as the transport may fire events, and goes inert
/// once the engine has been torn down.
pub trait TransportEvents: Send + Sync {
    /// Incoming bytes (`Ok`) or a transport failure (`Err`).
    ///
    /// Returns how many bytes of `buf` were consumed; the transport must
    /// re-present unconsumed bytes on a later callback. Only delivered while
    /// read delivery is enabled.
    fn read(&self, data: Result<&[u8], Error>) -> usize;

    /// The transport can accept more written bytes. Only delivered while
    /// write-ready delivery is enabled.
    fn write_ready(&self);

    /// Out-of-band data is pending on the transport.
    fn urgent(&self);
}
