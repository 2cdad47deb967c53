//! The base stream engine.
//!
//! A [`Stream`] composes a [`Transport`] with an optional [`Filter`] and
//! presents one uniform, callback-driven stream to the application. The
//! engine mediates everything between the three parties: the open handshake,
//! the read/write data path, write-draining close, the handshake retry
//! timer, reference counting, and deferred callback dispatch.
//!
//! # Locking
//!
//! One mutex guards all mutable engine state. User callbacks are always
//! invoked with the lock released, so an event handler may turn around and
//! call `close()` or `release()` on the stream that is calling it. The
//! filter's lower-write path (which feeds the user read callback through the
//! engine's sink) is likewise driven with the lock released; an `in_read`
//! flag keeps that delivery serial.
//!
//! # Lifetime
//!
//! Two counters, deliberately distinct:
//!
//! - `refcount` tracks async liveness: every outstanding transport
//!   open/close continuation and every scheduled deferred op holds one.
//! - `freeref` tracks user handles ([`Stream::retain`] / [`Stream::release`]).
//!
//! When `refcount` reaches zero the engine stops its timer *with
//! confirmation* before releasing anything, so a late expiration can never
//! observe a torn-down stream. The transport, filter, and platform handles
//! are released exactly once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{trace, warn};

use crate::error::{Error, FilterProgress, Progress};
use crate::filter::{Filter, FilterEvents};
use crate::platform::{Platform, Runner, RunnerHandler, Timer, TimerHandler};
use crate::transport::{OpenDone, Transport, TransportEvents};

/// Callbacks a [`Stream`] delivers to the application.
///
/// All callbacks run with the engine lock released: it is legal (and common)
/// to call back into the stream from inside any of them.
pub trait StreamEvents: Send + Sync {
    /// Decoded bytes (`Ok`) or a stream error (`Err`). Returns how many
    /// bytes were consumed; unconsumed bytes are re-delivered later. Only
    /// invoked while the stream is open and reads are enabled.
    fn read(&self, data: Result<&[u8], Error>) -> usize;

    /// The stream can accept more written bytes. Only invoked while writes
    /// are enabled.
    fn write_ready(&self);

    /// Out-of-band data arrived and no filter claimed it.
    fn urgent(&self) {}
}

/// Completion continuation for [`Stream::open`].
pub type StreamOpenDone = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Completion continuation for [`Stream::close`].
pub type StreamCloseDone = Box<dyn FnOnce() + Send>;

/// Lifecycle phase of the pipeline. The single source of truth for which
/// operations are legal at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    /// Waiting for the transport's asynchronous open.
    OpeningTransport,
    /// Transport is up; the filter handshake is in progress.
    OpeningFilter,
    Open,
    /// Close requested; flushing filter-buffered transport bytes first.
    CloseDraining,
    /// Drain done; the filter disconnect handshake is in progress.
    ClosingFilter,
    /// Waiting for the transport's close.
    ClosingTransport,
}

/// Which completion an in-flight transport close owes.
enum LlCloseKind {
    /// A normal close: deliver the close continuation.
    Normal,
    /// The open failed after the transport came up: deliver the open
    /// continuation with this error.
    OpenFailed(Error),
}

struct Inner {
    state: State,

    timer: Option<Arc<dyn Timer>>,
    runner: Option<Arc<dyn Runner>>,
    events: Option<Arc<dyn StreamEvents>>,

    /// Async liveness: outstanding transport continuations + deferred ops.
    refcount: u32,
    /// User handles.
    freeref: u32,

    open_done: Option<StreamOpenDone>,
    close_done: Option<StreamCloseDone>,
    ll_close_kind: Option<LlCloseKind>,

    read_enabled: bool,
    /// A read is being delivered upward (directly or via a deferred op);
    /// further transport reads are refused until it completes.
    in_read: bool,

    xmit_enabled: bool,
    /// Force one write-ready pass (server-side first handshake attempt).
    tmp_xmit_enabled: bool,

    /// Write error captured asynchronously; surfaced on the next write.
    saved_xmit_err: Option<Error>,
    /// Decode error captured during read delivery; surfaced as an error
    /// read on the next delivery opportunity.
    saved_rx_err: Option<Error>,

    /// The transport failed; it is probably not working any more.
    ll_err_occurred: bool,

    deferred_op_pending: bool,
    deferred_read: bool,
    deferred_open: bool,
    deferred_close: bool,
}

/// A layered stream: transport below, optional filter in the middle, the
/// application on top.
///
/// Constructed with [`Stream::client`] or [`Stream::server`], always behind
/// an [`Arc`]. All operations take `&self` and are safe to call from any
/// thread, including from inside the stream's own callbacks.
pub struct Stream {
    ll: Arc<dyn Transport>,
    filter: Option<Arc<dyn Filter>>,
    inner: Mutex<Inner>,
    weak_self: Weak<Stream>,
}

impl Stream {
    /// Create a client-side stream. It starts closed; call [`Stream::open`]
    /// to connect.
    pub fn client(
        platform: &dyn Platform,
        transport: Arc<dyn Transport>,
        filter: Option<Arc<dyn Filter>>,
        events: Arc<dyn StreamEvents>,
    ) -> Arc<Stream> {
        Self::alloc(platform, transport, filter, Some(events))
    }

    /// Create a server-side stream for an already-accepted transport.
    ///
    /// The stream starts in the filter-open phase and drives the first
    /// handshake attempt from the transport's write-ready path; `open_done`
    /// fires when the handshake completes. Register an event handler with
    /// [`Stream::set_events`] before enabling reads.
    pub fn server(
        platform: &dyn Platform,
        transport: Arc<dyn Transport>,
        filter: Option<Arc<dyn Filter>>,
        open_done: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) -> Result<Arc<Stream>, Error> {
        let stream = Self::alloc(platform, transport, filter, None);
        let mut g = stream.lock();
        if let Err(err) = stream.filter_setup() {
            stream.finish_free(&mut g);
            return Err(err);
        }
        g.open_done = Some(Box::new(open_done));
        set_state(&mut g, State::OpeningFilter);
        // Fire the first handshake attempt from the write-ready handler.
        g.tmp_xmit_enabled = true;
        stream.set_ll_enables(&mut g);
        drop(g);
        Ok(stream)
    }

    fn alloc(
        platform: &dyn Platform,
        transport: Arc<dyn Transport>,
        filter: Option<Arc<dyn Filter>>,
        events: Option<Arc<dyn StreamEvents>>,
    ) -> Arc<Stream> {
        let stream = Arc::new_cyclic(|weak: &Weak<Stream>| {
            let timer = platform.new_timer(Arc::new(TimerDispatch(weak.clone())));
            let runner = platform.new_runner(Arc::new(DeferredDispatch(weak.clone())));
            Stream {
                ll: transport,
                filter,
                inner: Mutex::new(Inner {
                    state: State::Closed,
                    timer: Some(timer),
                    runner: Some(runner),
                    events,
                    refcount: 1,
                    freeref: 1,
                    open_done: None,
                    close_done: None,
                    ll_close_kind: None,
                    read_enabled: false,
                    in_read: false,
                    xmit_enabled: false,
                    tmp_xmit_enabled: false,
                    saved_xmit_err: None,
                    saved_rx_err: None,
                    ll_err_occurred: false,
                    deferred_op_pending: false,
                    deferred_read: false,
                    deferred_open: false,
                    deferred_close: false,
                }),
                weak_self: weak.clone(),
            }
        });
        stream
            .ll
            .set_events(Arc::new(TransportDispatch(stream.weak_self.clone())));
        if let Some(filter) = &stream.filter {
            filter.set_events(Arc::new(FilterDispatch(stream.weak_self.clone())));
        }
        stream
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Connect the stream. Legal only while closed.
    ///
    /// `done` is invoked exactly once with the outcome, always from outside
    /// the caller's context, never from inside this call.
    pub fn open(
        &self,
        done: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) -> Result<(), Error> {
        let mut g = self.lock();
        if g.state != State::Closed {
            return Err(Error::Busy);
        }
        self.filter_setup()?;

        // Fresh epoch: nothing carries over from the previous connection.
        g.in_read = false;
        g.deferred_read = false;
        g.deferred_open = false;
        g.deferred_close = false;
        g.read_enabled = false;
        g.xmit_enabled = false;
        g.tmp_xmit_enabled = false;
        g.ll_err_occurred = false;
        g.saved_xmit_err = None;
        g.saved_rx_err = None;

        g.open_done = Some(Box::new(done));
        let weak = self.weak_self.clone();
        let ll_done: OpenDone = Box::new(move |res| {
            if let Some(stream) = weak.upgrade() {
                stream.ll_open_complete(res);
            }
        });
        match self.ll.open(ll_done) {
            Ok(Progress::Complete) => {
                // The transport is usable now, but the handshake (and the
                // open completion) must run outside the caller's context.
                set_state(&mut g, State::OpeningFilter);
                g.deferred_open = true;
                self.sched_deferred_op(&mut g);
                Ok(())
            }
            Ok(Progress::Pending) => {
                set_state(&mut g, State::OpeningTransport);
                g.refcount += 1;
                Ok(())
            }
            Err(err) => {
                self.filter_cleanup();
                g.open_done = None;
                Err(err)
            }
        }
    }

    /// Disconnect the stream. Legal while open or while an open is still in
    /// flight; `done` is invoked exactly once when the stream reaches
    /// closed.
    pub fn close(&self, done: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        let mut g = self.lock();
        match g.state {
            State::Open => {
                g = self.i_close(g, Some(Box::new(done)));
            }
            State::OpeningTransport | State::OpeningFilter => {
                // Take over the in-flight open. Closing the transport
                // cancels a pending transport open, so release the
                // reference that open was holding.
                let open_ref_held = g.state == State::OpeningTransport;
                g = self.i_close(g, Some(Box::new(done)));
                if open_ref_held {
                    deref(&mut g);
                }
            }
            _ => return Err(Error::Busy),
        }
        drop(g);
        Ok(())
    }

    /// Write bytes. Returns how many the stream accepted, which may be
    /// short (or zero) under backpressure.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut g = self.lock();
        let res = if g.state != State::Open {
            Err(Error::NotOpen)
        } else if let Some(err) = g.saved_xmit_err.take() {
            Err(err)
        } else {
            self.filter_ul_write(buf)
        };
        self.set_ll_enables(&mut g);
        res
    }

    /// Allow or suppress delivery of the user read callback.
    pub fn set_read_enabled(&self, enabled: bool) {
        let mut g = self.lock();
        if matches!(
            g.state,
            State::Closed | State::ClosingFilter | State::ClosingTransport
        ) {
            return;
        }
        g.read_enabled = enabled;
        let read_pending = self.filter_ul_read_pending();
        if g.in_read
            || g.state == State::OpeningFilter
            || g.state == State::OpeningTransport
            || (read_pending && !enabled)
        {
            // Nothing to do; the in-flight read or open path reconciles.
        } else if read_pending {
            // The filter already holds decoded bytes; flush them from the
            // deferred runner. in_read keeps transport reads away while the
            // flush is queued.
            g.in_read = true;
            g.deferred_read = true;
            self.sched_deferred_op(&mut g);
        } else {
            self.set_ll_enables(&mut g);
        }
    }

    /// Allow or suppress delivery of the user write-ready callback.
    pub fn set_write_enabled(&self, enabled: bool) {
        let mut g = self.lock();
        if matches!(
            g.state,
            State::Closed | State::ClosingFilter | State::ClosingTransport
        ) {
            return;
        }
        if g.xmit_enabled != enabled {
            g.xmit_enabled = enabled;
            self.set_ll_enables(&mut g);
        }
    }

    /// Register (or replace) the application event handler.
    pub fn set_events(&self, events: Arc<dyn StreamEvents>) {
        self.lock().events = Some(events);
    }

    /// Take an additional user handle on this stream.
    pub fn retain(&self) {
        self.lock().freeref += 1;
    }

    /// Drop a user handle.
    ///
    /// When the last handle is dropped the stream is torn down: an
    /// in-flight close continues but its continuation is suppressed, an
    /// open stream is closed internally, and all resources are released
    /// once outstanding async work completes. No further callbacks reach
    /// the application.
    pub fn release(&self) {
        let mut g = self.lock();
        assert!(g.freeref > 0);
        g.freeref -= 1;
        if g.freeref > 0 {
            return;
        }

        match g.state {
            State::ClosingFilter | State::ClosingTransport => {
                g.close_done = None;
            }
            State::OpeningTransport | State::OpeningFilter => {
                let open_ref_held = g.state == State::OpeningTransport;
                g = self.i_close(g, None);
                if open_ref_held {
                    deref(&mut g);
                }
            }
            State::Closed => {}
            _ => {
                g = self.i_close(g, None);
            }
        }
        // Lose the initial reference so the stream is freed when the
        // outstanding work finishes.
        self.deref_and_unlock(g);
    }

    /// Human-readable remote endpoint description, from the transport.
    pub fn remote_addr_str(&self) -> String {
        self.ll.remote_addr_str()
    }

    /// Remote socket address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.ll.remote_addr()
    }

    /// Transport-specific remote identifier, when the transport has one.
    pub fn remote_id(&self) -> Option<i64> {
        self.ll.remote_id()
    }

    // ------------------------------------------------------------------
    // Lock and lifetime plumbing
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Drop one async reference and release the lock. On the last
    /// reference, drain the timer before releasing resources: a timer
    /// expiration is the one callback that can outlive the final deref.
    fn deref_and_unlock(&self, mut g: MutexGuard<'_, Inner>) {
        assert!(g.refcount > 0);
        g.refcount -= 1;
        let count = g.refcount;
        drop(g);
        if count > 0 {
            return;
        }

        let timer = self.lock().timer.clone();
        if let Some(timer) = timer {
            if let Some(stream) = self.weak_self.upgrade() {
                let stopping = timer.stop_with_done(Box::new(move || {
                    let mut g = stream.lock();
                    stream.finish_free(&mut g);
                }));
                if stopping {
                    return;
                }
            }
        }
        let mut g = self.lock();
        self.finish_free(&mut g);
    }

    /// Release every resource the engine owns. Runs exactly once.
    fn finish_free(&self, g: &mut Inner) {
        g.timer = None;
        g.runner = None;
        g.events = None;
        g.open_done = None;
        g.close_done = None;
        if let Some(filter) = &self.filter {
            filter.free();
        }
        self.ll.free();
    }

    fn sched_deferred_op(&self, g: &mut Inner) {
        if !g.deferred_op_pending {
            // Run user-visible work from the platform runner to avoid lock
            // nesting with the caller's context.
            g.deferred_op_pending = true;
            g.refcount += 1;
            if let Some(runner) = &g.runner {
                runner.run();
            }
        }
    }

    // ------------------------------------------------------------------
    // Filter access (identity behavior when no filter is installed)
    // ------------------------------------------------------------------

    fn filter_ul_read_pending(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| f.ul_read_pending())
    }

    fn filter_ll_write_pending(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| f.ll_write_pending())
    }

    fn filter_ll_read_needed(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| f.ll_read_needed())
    }

    fn filter_setup(&self) -> Result<(), Error> {
        match &self.filter {
            Some(filter) => filter.setup(),
            None => Ok(()),
        }
    }

    fn filter_cleanup(&self) {
        if let Some(filter) = &self.filter {
            filter.cleanup();
        }
    }

    fn filter_check_open_done(&self) -> Result<(), Error> {
        match &self.filter {
            Some(filter) => filter.check_open_done(),
            None => Ok(()),
        }
    }

    fn filter_try_connect(&self) -> Result<FilterProgress, Error> {
        match &self.filter {
            Some(filter) => filter.try_connect(),
            None => Ok(FilterProgress::Done),
        }
    }

    fn filter_try_disconnect(&self) -> Result<FilterProgress, Error> {
        match &self.filter {
            Some(filter) => filter.try_disconnect(),
            None => Ok(FilterProgress::Done),
        }
    }

    /// User bytes in, encoded bytes out to the transport write sink.
    /// Called with the engine lock held; the sink does not take it.
    fn filter_ul_write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut sink = |bytes: &[u8]| self.ll.write(bytes);
        match &self.filter {
            Some(filter) => filter.ul_write(&mut sink, buf),
            None => sink(buf),
        }
    }

    /// Transport bytes in, decoded bytes out to the user read sink.
    /// Called with the engine lock released; the sink takes it briefly.
    fn filter_ll_write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut sink = |bytes: &[u8]| self.deliver_read(bytes);
        match &self.filter {
            Some(filter) => filter.ll_write(&mut sink, buf),
            None => sink(buf),
        }
    }

    fn filter_ll_urgent(&self) {
        match &self.filter {
            Some(filter) => filter.ll_urgent(),
            None => {
                let events = self.lock().events.clone();
                if let Some(events) = events {
                    events.urgent();
                }
            }
        }
    }

    /// The engine's read sink: deliver decoded bytes upward if the stream
    /// is open and reads are enabled, else accept nothing (backpressure -
    /// the filter keeps the bytes buffered).
    fn deliver_read(&self, buf: &[u8]) -> Result<usize, Error> {
        let events = {
            let g = self.lock();
            if g.state != State::Open || !g.read_enabled {
                return Ok(0);
            }
            g.events.clone()
        };
        match events {
            Some(events) => Ok(events.read(Ok(buf))),
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Enable reconciliation
    // ------------------------------------------------------------------

    /// Recompute the transport's callback enables from engine state. Runs
    /// at the tail of every public entry and every callback.
    fn set_ll_enables(&self, g: &mut Inner) {
        if self.filter_ll_write_pending() || g.xmit_enabled || g.tmp_xmit_enabled {
            self.ll.set_write_enabled(true);
        }
        let want_read = !g.in_read
            && match g.state {
                State::Open => {
                    (g.read_enabled && !self.filter_ul_read_pending())
                        || self.filter_ll_read_needed()
                }
                State::OpeningFilter | State::ClosingFilter => true,
                _ => false,
            };
        if want_read {
            self.ll.set_read_enabled(true);
        }
    }

    // ------------------------------------------------------------------
    // Open path
    // ------------------------------------------------------------------

    /// Deliver the open completion and move to the terminal state for it.
    fn finish_open<'a>(
        &'a self,
        mut g: MutexGuard<'a, Inner>,
        res: Result<(), Error>,
    ) -> MutexGuard<'a, Inner> {
        match &res {
            Ok(()) => set_state(&mut g, State::Open),
            Err(err) => {
                trace!("stream open failed: {err}");
                set_state(&mut g, State::Closed);
                self.filter_cleanup();
            }
        }
        if let Some(done) = g.open_done.take() {
            drop(g);
            done(res);
            g = self.lock();
        }
        g
    }

    /// Drive the filter's connect handshake one step.
    fn try_connect<'a>(&'a self, mut g: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        if g.state != State::OpeningFilter {
            // Timer, transport read, and transport write-ready can race to
            // drive the handshake; later arrivals are no-ops.
            return g;
        }

        self.ll.set_write_enabled(false);
        self.ll.set_read_enabled(false);

        match self.filter_try_connect() {
            Ok(FilterProgress::Pending) => g,
            Ok(FilterProgress::RetryAfter(timeout)) => {
                if let Some(timer) = &g.timer {
                    timer.start(timeout);
                }
                g
            }
            Ok(FilterProgress::Done) => match self.filter_check_open_done() {
                Ok(()) => self.finish_open(g, Ok(())),
                Err(err) => {
                    set_state(&mut g, State::ClosingTransport);
                    self.issue_ll_close(g, LlCloseKind::OpenFailed(err))
                }
            },
            Err(err) => {
                set_state(&mut g, State::ClosingTransport);
                self.issue_ll_close(g, LlCloseKind::OpenFailed(err))
            }
        }
    }

    /// Completion of an asynchronous transport open.
    fn ll_open_complete(&self, res: Result<(), Error>) {
        let mut g = self.lock();
        match res {
            Err(err) => {
                g = self.finish_open(g, Err(err));
            }
            Ok(()) => {
                set_state(&mut g, State::OpeningFilter);
                g = self.try_connect(g);
                self.set_ll_enables(&mut g);
            }
        }
        self.deref_and_unlock(g);
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    /// Deliver the close completion and return to closed.
    fn finish_close<'a>(&'a self, mut g: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.filter_cleanup();
        set_state(&mut g, State::Closed);
        if let Some(done) = g.close_done.take() {
            drop(g);
            done();
            g = self.lock();
        }
        g
    }

    /// Issue the transport close, remembering which completion it owes.
    /// An immediate completion is re-dispatched through the deferred
    /// runner, never delivered inline.
    fn issue_ll_close<'a>(
        &'a self,
        mut g: MutexGuard<'a, Inner>,
        kind: LlCloseKind,
    ) -> MutexGuard<'a, Inner> {
        g.ll_close_kind = Some(kind);
        let weak = self.weak_self.clone();
        let done = Box::new(move || {
            if let Some(stream) = weak.upgrade() {
                stream.ll_close_complete();
            }
        });
        match self.ll.close(done) {
            Progress::Pending => {
                g.refcount += 1;
            }
            Progress::Complete => {
                g.deferred_close = true;
                self.sched_deferred_op(&mut g);
            }
        }
        g
    }

    /// Dispatch the completion an issued transport close owed.
    fn run_ll_close_done<'a>(&'a self, mut g: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        match g.ll_close_kind.take() {
            Some(LlCloseKind::OpenFailed(err)) => self.finish_open(g, Err(err)),
            _ => self.finish_close(g),
        }
    }

    /// Completion of an asynchronous transport close.
    fn ll_close_complete(&self) {
        let g = self.lock();
        let g = self.run_ll_close_done(g);
        self.deref_and_unlock(g);
    }

    /// Drive the filter's disconnect handshake one step.
    fn try_close<'a>(&'a self, mut g: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.ll.set_write_enabled(false);
        self.ll.set_read_enabled(false);

        match self.filter_try_disconnect() {
            Ok(FilterProgress::Pending) => g,
            Ok(FilterProgress::RetryAfter(timeout)) => {
                if let Some(timer) = &g.timer {
                    timer.start(timeout);
                }
                g
            }
            res => {
                if let Err(err) = res {
                    warn!("filter disconnect failed, closing transport anyway: {err}");
                }
                set_state(&mut g, State::ClosingTransport);
                self.issue_ll_close(g, LlCloseKind::Normal)
            }
        }
    }

    /// Route the stream into the right close path for its current state.
    fn i_close<'a>(
        &'a self,
        mut g: MutexGuard<'a, Inner>,
        close_done: Option<StreamCloseDone>,
    ) -> MutexGuard<'a, Inner> {
        g.close_done = close_done;
        if g.ll_err_occurred {
            // The transport already failed; there is nothing to drain and
            // no point in a filter goodbye.
            set_state(&mut g, State::ClosingTransport);
            g = self.issue_ll_close(g, LlCloseKind::Normal);
        } else if self.filter_ll_write_pending() {
            set_state(&mut g, State::CloseDraining);
        } else {
            set_state(&mut g, State::ClosingFilter);
            g = self.try_close(g);
        }
        self.set_ll_enables(&mut g);
        g
    }

    // ------------------------------------------------------------------
    // Transport event handlers
    // ------------------------------------------------------------------

    /// Incoming transport bytes or a transport failure.
    fn ll_read(&self, data: Result<&[u8], Error>) -> usize {
        let mut g = self.lock();
        self.ll.set_read_enabled(false);

        let buf = match data {
            Err(err) => {
                // Latch the failure. read_enabled is cleared before the
                // user callback so the handler can choose to re-enable.
                g.read_enabled = false;
                g.ll_err_occurred = true;
                match g.state {
                    State::OpeningTransport | State::OpeningFilter => {
                        // Closing the transport abandons a pending open;
                        // release the reference that open was holding.
                        let open_ref_held = g.state == State::OpeningTransport;
                        set_state(&mut g, State::ClosingTransport);
                        g = self.issue_ll_close(g, LlCloseKind::OpenFailed(Error::CommError));
                        if open_ref_held {
                            deref(&mut g);
                        }
                    }
                    State::CloseDraining | State::ClosingFilter => {
                        set_state(&mut g, State::ClosingTransport);
                        g = self.issue_ll_close(g, LlCloseKind::Normal);
                    }
                    _ => {
                        if let Some(events) = g.events.clone() {
                            drop(g);
                            events.read(Err(err));
                            g = self.lock();
                        } else {
                            g = self.i_close(g, None);
                        }
                    }
                }
                self.set_ll_enables(&mut g);
                return 0;
            }
            Ok(buf) => buf,
        };

        if g.in_read {
            // A deferred read owns delivery; the transport re-presents
            // these bytes later.
            return 0;
        }

        if g.saved_rx_err.is_some() && g.state == State::Open {
            let err = g.saved_rx_err.take().unwrap();
            if let Some(events) = g.events.clone() {
                drop(g);
                events.read(Err(err));
                g = self.lock();
            } else {
                warn!("dropping latched receive error {err}: no event handler");
            }
        }

        let mut consumed = 0;
        if !buf.is_empty() {
            g.in_read = true;
            drop(g);
            let res = self.filter_ll_write(buf);
            g = self.lock();
            g.in_read = false;
            match res {
                Ok(count) => consumed = count,
                Err(err) => {
                    g.saved_rx_err = Some(err);
                }
            }

            // The handshake paths may have been waiting on these bytes.
            if g.state == State::OpeningFilter {
                g = self.try_connect(g);
            }
            if g.state == State::ClosingFilter {
                g = self.try_close(g);
            }
        }

        self.set_ll_enables(&mut g);
        consumed
    }

    /// The transport can accept more bytes.
    fn ll_write_ready(&self) {
        let mut g = self.lock();
        self.ll.set_write_enabled(false);

        if self.filter_ll_write_pending() {
            // Drive the filter's buffered transport bytes out.
            if let Err(err) = self.filter_ul_write(&[]) {
                g.saved_xmit_err = Some(err);
            }
        }

        if g.state == State::CloseDraining && !self.filter_ll_write_pending() {
            set_state(&mut g, State::ClosingFilter);
        }
        if g.state == State::OpeningFilter {
            g = self.try_connect(g);
        }
        if g.state == State::ClosingFilter {
            g = self.try_close(g);
        }
        if g.state != State::OpeningFilter && !self.filter_ll_write_pending() && g.xmit_enabled {
            if let Some(events) = g.events.clone() {
                drop(g);
                events.write_ready();
                g = self.lock();
            }
        }

        g.tmp_xmit_enabled = false;
        self.set_ll_enables(&mut g);
    }

    fn ll_urgent(&self) {
        self.filter_ll_urgent();
    }

    // ------------------------------------------------------------------
    // Timer and deferred dispatch
    // ------------------------------------------------------------------

    fn timer_fired(&self) {
        let mut g = self.lock();
        match g.state {
            State::OpeningFilter => {
                g = self.try_connect(g);
            }
            State::ClosingFilter => {
                g = self.try_close(g);
            }
            State::Open => {
                if let Some(filter) = self.filter.clone() {
                    drop(g);
                    filter.timeout();
                    g = self.lock();
                }
            }
            _ => {}
        }
        self.set_ll_enables(&mut g);
    }

    /// The deferred-op runner: delivers the user-visible work that was
    /// moved out of an inbound context.
    fn deferred_op(&self) {
        let mut g = self.lock();
        loop {
            if g.deferred_open {
                g.deferred_open = false;
                g = self.try_connect(g);
            }

            if g.deferred_close {
                g.deferred_close = false;
                g = self.run_ll_close_done(g);
            }

            if g.deferred_read {
                if g.state != State::Open {
                    // The close path won; the flags reset on the next open.
                    break;
                }
                g.deferred_read = false;
                drop(g);
                let res = self.filter_ll_write(&[]);
                g = self.lock();
                g.in_read = false;
                if let Err(err) = res {
                    g.saved_rx_err = Some(err);
                }
            }

            if !(g.deferred_read || g.deferred_open || g.deferred_close) {
                break;
            }
        }

        g.deferred_op_pending = false;
        self.set_ll_enables(&mut g);
        self.deref_and_unlock(g);
    }

    // ------------------------------------------------------------------
    // Filter event handlers
    // ------------------------------------------------------------------

    /// The filter produced transport-bound bytes; make sure the write-ready
    /// path runs. Deliberately lock-free: filters call this from inside
    /// engine-driven write paths.
    fn filter_output_ready(&self) {
        self.ll.set_write_enabled(true);
    }

    fn filter_start_timer(&self, timeout: Duration) {
        let g = self.lock();
        if g.state == State::Open {
            if let Some(timer) = &g.timer {
                timer.start(timeout);
            }
        }
    }
}

fn set_state(g: &mut Inner, state: State) {
    if g.state != state {
        trace!("stream state {:?} -> {:?}", g.state, state);
        g.state = state;
    }
}

/// Drop one async reference that is guaranteed not to be the last.
fn deref(g: &mut Inner) {
    assert!(g.refcount > 1);
    g.refcount -= 1;
}

// Non-owning dispatch handles: the engine owns its transport, filter, timer,
// and runner; the references they hold back into the engine are weak, so the
// callback cycle never keeps a dead stream alive.

struct TransportDispatch(Weak<Stream>);

impl TransportEvents for TransportDispatch {
    fn read(&self, data: Result<&[u8], Error>) -> usize {
        match self.0.upgrade() {
            Some(stream) => stream.ll_read(data),
            None => 0,
        }
    }

    fn write_ready(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.ll_write_ready();
        }
    }

    fn urgent(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.ll_urgent();
        }
    }
}

struct FilterDispatch(Weak<Stream>);

impl FilterEvents for FilterDispatch {
    fn output_ready(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.filter_output_ready();
        }
    }

    fn start_timer(&self, timeout: Duration) {
        if let Some(stream) = self.0.upgrade() {
            stream.filter_start_timer(timeout);
        }
    }
}

struct TimerDispatch(Weak<Stream>);

impl TimerHandler for TimerDispatch {
    fn timeout(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.timer_fired();
        }
    }
}

struct DeferredDispatch(Weak<Stream>);

impl RunnerHandler for DeferredDispatch {
    fn run(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.deferred_op();
        }
    }
}
