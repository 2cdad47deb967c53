//! The filter contract: an optional encode/decode layer inside a stream.
//!
//! A filter sits between the user and the transport and owns the byte
//! transformation in both directions: TLS record framing, telnet option
//! processing, or anything else that needs a handshake and per-direction
//! buffering. The engine owns its filter exclusively and serializes all
//! calls into it; a stream without a filter behaves as if an identity filter
//! were installed.
//!
//! Data never crosses this boundary by return value. Both write paths take a
//! *sink*: the filter pushes transformed bytes into the sink and reports how
//! much of its own input it consumed. A filter may consume input without
//! producing output (buffering a partial TLS record) or produce output
//! without consuming input (flushing bytes buffered earlier): the
//! `*_pending`/`*_needed` probes tell the engine which of those states it is
//! in so read/write enables can be reconciled.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, FilterProgress};

/// Byte sink handed to [`Filter::ul_write`] / [`Filter::ll_write`].
///
/// Returns how many of the offered bytes the sink accepted; a short count is
/// backpressure, and the filter keeps the remainder buffered.
pub type DataSink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<usize, Error>;

/// An encode/decode layer between the user and the transport.
///
/// Implementations are internally synchronized, but must not hold an
/// internal lock across a sink call: the engine's read sink delivers to the
/// user callback, and the user may re-enter the stream (and thereby the
/// filter's `try_disconnect` and probes) from inside it. Take buffered
/// bytes out under the lock, release it, then drive the sink.
pub trait Filter: Send + Sync {
    /// Register the engine's event handle. Called once, before any other
    /// operation.
    fn set_events(&self, events: Arc<dyn FilterEvents>);

    /// Prepare for a new connection epoch. Called at the start of every
    /// open; a failure aborts the open synchronously.
    fn setup(&self) -> Result<(), Error>;

    /// Discard per-epoch state. Called when the stream finishes closing or
    /// an open fails.
    fn cleanup(&self);

    /// Decoded bytes are buffered and ready for the user.
    fn ul_read_pending(&self) -> bool;

    /// Encoded bytes are buffered and waiting to be written to the
    /// transport.
    fn ll_write_pending(&self) -> bool;

    /// The filter needs more transport bytes before it can make progress
    /// (e.g. mid-record), regardless of user read interest.
    fn ll_read_needed(&self) -> bool;

    /// Post-handshake verification (certificate/key checks). Only called
    /// after `try_connect` reports [`FilterProgress::Done`]; an error fails
    /// the open.
    fn check_open_done(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Drive the connect handshake one step.
    fn try_connect(&self) -> Result<FilterProgress, Error>;

    /// Drive the disconnect handshake one step.
    fn try_disconnect(&self) -> Result<FilterProgress, Error>;

    /// Accept user bytes from `buf`, pushing encoded bytes into `sink`
    /// (which writes to the transport). Returns how many bytes of `buf`
    /// were accepted. Called with an empty `buf` to flush previously
    /// buffered encoded bytes.
    fn ul_write(&self, sink: DataSink<'_>, buf: &[u8]) -> Result<usize, Error>;

    /// Accept transport bytes from `buf`, pushing decoded bytes into `sink`
    /// (which delivers to the user). Returns how many bytes of `buf` were
    /// consumed. Called with an empty `buf` to flush previously buffered
    /// decoded bytes.
    fn ll_write(&self, sink: DataSink<'_>, buf: &[u8]) -> Result<usize, Error>;

    /// Out-of-band data arrived on the transport.
    fn ll_urgent(&self) {}

    /// A timer armed via [`FilterEvents::start_timer`] expired.
    fn timeout(&self) {}

    /// The engine is done with this filter; release its resources. Called
    /// exactly once, after which no other operation is invoked.
    fn free(&self);
}

/// Engine-side callbacks a filter uses to request service.
pub trait FilterEvents: Send + Sync {
    /// The filter has produced transport-bound bytes outside a write call
    /// and needs the write-ready path driven. Safe to call from any filter
    /// context, including inside `ul_write`/`ll_write`.
    fn output_ready(&self);

    /// Arm the stream's timer; [`Filter::timeout`] fires on expiry. Only
    /// honored while the stream is open, and must not be called from inside
    /// `try_connect`/`try_disconnect`; return
    /// [`FilterProgress::RetryAfter`] from those instead.
    fn start_timer(&self, timeout: Duration);
}
