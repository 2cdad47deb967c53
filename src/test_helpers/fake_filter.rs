use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};

use crate::error::{Error, FilterProgress};
use crate::filter::{DataSink, Filter, FilterEvents};

struct FakeFilterState {
    events: Option<Arc<dyn FilterEvents>>,
    connect_script: VecDeque<Result<FilterProgress, Error>>,
    disconnect_script: VecDeque<Result<FilterProgress, Error>>,
    check_open_result: Result<(), Error>,
    setup_result: Result<(), Error>,
    /// Transport-bound bytes not yet accepted by the transport.
    ll_buf: BytesMut,
    /// Decoded bytes not yet accepted by the user.
    ul_buf: BytesMut,
    ll_read_needed: bool,
    fail_next_ll_write: Option<Error>,
    setups: u32,
    cleanups: u32,
    frees: u32,
    connect_calls: u32,
    disconnect_calls: u32,
    timeouts: u32,
    urgents: u32,
}

/// An identity filter with test-controlled buffering and handshake.
///
/// Bytes pass through unchanged in both directions, but are buffered
/// whenever the downstream sink exerts backpressure, which is exactly the
/// behavior the engine's pending/enable bookkeeping has to cope with. The
/// connect/disconnect handshakes replay scripted step results.
pub struct FakeFilter {
    state: Mutex<FakeFilterState>,
}

impl FakeFilter {
    pub fn new() -> Arc<FakeFilter> {
        Arc::new(FakeFilter {
            state: Mutex::new(FakeFilterState {
                events: None,
                connect_script: VecDeque::new(),
                disconnect_script: VecDeque::new(),
                check_open_result: Ok(()),
                setup_result: Ok(()),
                ll_buf: BytesMut::new(),
                ul_buf: BytesMut::new(),
                ll_read_needed: false,
                fail_next_ll_write: None,
                setups: 0,
                cleanups: 0,
                frees: 0,
                connect_calls: 0,
                disconnect_calls: 0,
                timeouts: 0,
                urgents: 0,
            }),
        })
    }

    /// Step results `try_connect` replays; once exhausted it reports done.
    pub fn script_connect(&self, steps: Vec<Result<FilterProgress, Error>>) {
        self.state.lock().unwrap().connect_script = steps.into();
    }

    /// Step results `try_disconnect` replays; once exhausted it reports
    /// done.
    pub fn script_disconnect(&self, steps: Vec<Result<FilterProgress, Error>>) {
        self.state.lock().unwrap().disconnect_script = steps.into();
    }

    pub fn set_check_open_result(&self, res: Result<(), Error>) {
        self.state.lock().unwrap().check_open_result = res;
    }

    pub fn set_setup_result(&self, res: Result<(), Error>) {
        self.state.lock().unwrap().setup_result = res;
    }

    pub fn set_ll_read_needed(&self, needed: bool) {
        self.state.lock().unwrap().ll_read_needed = needed;
    }

    /// Fail the next decode (`ll_write`) call with `err`.
    pub fn fail_next_ll_write(&self, err: Error) {
        self.state.lock().unwrap().fail_next_ll_write = Some(err);
    }

    /// Pretend the filter already encoded bytes the transport has not
    /// accepted yet (e.g. handshake output).
    pub fn queue_ll_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().ll_buf.extend_from_slice(bytes);
    }

    /// Pretend the filter already decoded bytes the user has not consumed
    /// yet.
    pub fn queue_ul_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().ul_buf.extend_from_slice(bytes);
    }

    pub fn ll_pending_len(&self) -> usize {
        self.state.lock().unwrap().ll_buf.len()
    }

    pub fn ul_pending_len(&self) -> usize {
        self.state.lock().unwrap().ul_buf.len()
    }

    pub fn events(&self) -> Option<Arc<dyn FilterEvents>> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn setups(&self) -> u32 {
        self.state.lock().unwrap().setups
    }

    pub fn cleanups(&self) -> u32 {
        self.state.lock().unwrap().cleanups
    }

    pub fn frees(&self) -> u32 {
        self.state.lock().unwrap().frees
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().unwrap().disconnect_calls
    }

    pub fn timeouts(&self) -> u32 {
        self.state.lock().unwrap().timeouts
    }

    pub fn urgents(&self) -> u32 {
        self.state.lock().unwrap().urgents
    }

    /// Drain `which` buffer through `sink` without holding the internal
    /// lock across sink calls; whatever the sink refuses goes back to the
    /// front of the buffer.
    fn flush(&self, which: Dir, sink: DataSink<'_>) -> Result<(), Error> {
        let mut pending = {
            let mut state = self.state.lock().unwrap();
            match which {
                Dir::Ll => state.ll_buf.split(),
                Dir::Ul => state.ul_buf.split(),
            }
        };
        let mut result = Ok(());
        while !pending.is_empty() {
            match sink(&pending) {
                Ok(0) => break,
                Ok(count) => pending.advance(count),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if !pending.is_empty() {
            let mut state = self.state.lock().unwrap();
            let buf = match which {
                Dir::Ll => &mut state.ll_buf,
                Dir::Ul => &mut state.ul_buf,
            };
            let mut rebuilt = BytesMut::with_capacity(pending.len() + buf.len());
            rebuilt.extend_from_slice(&pending);
            rebuilt.extend_from_slice(buf);
            *buf = rebuilt;
        }
        result
    }
}

#[derive(Clone, Copy)]
enum Dir {
    Ll,
    Ul,
}

impl Filter for FakeFilter {
    fn set_events(&self, events: Arc<dyn FilterEvents>) {
        self.state.lock().unwrap().events = Some(events);
    }

    fn setup(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.setups += 1;
        state.setup_result.clone()
    }

    fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        state.cleanups += 1;
        state.ll_buf.clear();
        state.ul_buf.clear();
    }

    fn ul_read_pending(&self) -> bool {
        !self.state.lock().unwrap().ul_buf.is_empty()
    }

    fn ll_write_pending(&self) -> bool {
        !self.state.lock().unwrap().ll_buf.is_empty()
    }

    fn ll_read_needed(&self) -> bool {
        self.state.lock().unwrap().ll_read_needed
    }

    fn check_open_done(&self) -> Result<(), Error> {
        self.state.lock().unwrap().check_open_result.clone()
    }

    fn try_connect(&self) -> Result<FilterProgress, Error> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        state
            .connect_script
            .pop_front()
            .unwrap_or(Ok(FilterProgress::Done))
    }

    fn try_disconnect(&self) -> Result<FilterProgress, Error> {
        let mut state = self.state.lock().unwrap();
        state.disconnect_calls += 1;
        state
            .disconnect_script
            .pop_front()
            .unwrap_or(Ok(FilterProgress::Done))
    }

    fn ul_write(&self, sink: DataSink<'_>, buf: &[u8]) -> Result<usize, Error> {
        self.state.lock().unwrap().ll_buf.extend_from_slice(buf);
        self.flush(Dir::Ll, sink)?;
        Ok(buf.len())
    }

    fn ll_write(&self, sink: DataSink<'_>, buf: &[u8]) -> Result<usize, Error> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.fail_next_ll_write.take() {
                return Err(err);
            }
            state.ul_buf.extend_from_slice(buf);
        }
        self.flush(Dir::Ul, sink)?;
        Ok(buf.len())
    }

    fn ll_urgent(&self) {
        self.state.lock().unwrap().urgents += 1;
    }

    fn timeout(&self) {
        self.state.lock().unwrap().timeouts += 1;
    }

    fn free(&self) {
        self.state.lock().unwrap().frees += 1;
    }
}
