use std::io::ErrorKind;
use std::time::Duration;

/// Errors reported by a [`Stream`](crate::Stream) and by the transport and
/// filter layers beneath it.
///
/// The variants are a stable vocabulary: callers can match on them to drive
/// retry/teardown decisions without inspecting message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The stream is not open; the operation needs an open stream.
    #[error("stream is not open")]
    NotOpen,

    /// The stream is in the wrong phase for this operation, e.g. `open`
    /// while not closed or `close` while already closing.
    #[error("stream is busy in another phase")]
    Busy,

    /// The transport failed; the stream is draining toward closed.
    #[error("transport communication failure")]
    CommError,

    /// A platform resource could not be allocated during construction.
    #[error("platform resource allocation failed")]
    NoMemory,

    /// An I/O failure from the transport or filter, reduced to its kind so
    /// the error stays cheap to latch and clone.
    #[error("i/o failure: {0:?}")]
    Io(ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.kind())
    }
}

/// Outcome of a transport `open` or `close` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation finished before the call returned; the completion
    /// continuation will not be invoked.
    Complete,
    /// The operation continues asynchronously; the completion continuation
    /// will be invoked exactly once when it finishes.
    Pending,
}

/// Outcome of one step of a filter handshake (`try_connect` /
/// `try_disconnect`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterProgress {
    /// The handshake is complete.
    Done,
    /// The filter is waiting on transport I/O; the next read or write-ready
    /// event re-drives the handshake.
    Pending,
    /// The filter wants to be stepped again after the given delay even if no
    /// I/O arrives.
    RetryAfter(Duration),
}
