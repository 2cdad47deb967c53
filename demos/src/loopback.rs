use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::trace;

use strata::{CloseDone, Error, OpenDone, Progress, Transport, TransportEvents};

struct LoopbackState {
    events: Option<Arc<dyn TransportEvents>>,
    /// Bytes written to the transport, waiting to come back as reads.
    inbound: VecDeque<u8>,
    read_enabled: bool,
    write_enabled: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<LoopbackState>,
    cond: Condvar,
}

/// A transport that reflects everything written to it back as incoming
/// bytes, delivered from its own thread, enough to drive a whole stream
/// epoch without touching a network.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create the transport and start its delivery thread.
    pub fn new() -> Arc<LoopbackTransport> {
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopbackState {
                events: None,
                inbound: VecDeque::new(),
                read_enabled: false,
                write_enabled: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("loopback".to_string())
            .spawn(move || delivery_loop(thread_shared))
            .expect("failed to spawn loopback thread");
        Arc::new(LoopbackTransport { shared })
    }
}

fn delivery_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }

        if state.write_enabled {
            state.write_enabled = false;
            if let Some(events) = state.events.clone() {
                drop(state);
                events.write_ready();
                state = shared.state.lock().unwrap();
            }
            continue;
        }

        if state.read_enabled && !state.inbound.is_empty() {
            if let Some(events) = state.events.clone() {
                let buf: Vec<u8> = state.inbound.iter().copied().collect();
                drop(state);
                let consumed = events.read(Ok(&buf));
                trace!("loopback delivered {} of {} bytes", consumed, buf.len());
                state = shared.state.lock().unwrap();
                state.inbound.drain(..consumed);
                continue;
            }
        }

        state = shared.cond.wait(state).unwrap();
    }
}

impl Transport for LoopbackTransport {
    fn set_events(&self, events: Arc<dyn TransportEvents>) {
        self.shared.state.lock().unwrap().events = Some(events);
    }

    fn open(&self, _done: OpenDone) -> Result<Progress, Error> {
        Ok(Progress::Complete)
    }

    fn close(&self, _done: CloseDone) -> Progress {
        let mut state = self.shared.state.lock().unwrap();
        state.inbound.clear();
        Progress::Complete
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut state = self.shared.state.lock().unwrap();
        state.inbound.extend(buf.iter().copied());
        self.shared.cond.notify_one();
        Ok(buf.len())
    }

    fn set_read_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.read_enabled = enabled;
        self.shared.cond.notify_one();
    }

    fn set_write_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.write_enabled = enabled;
        self.shared.cond.notify_one();
    }

    fn remote_addr_str(&self) -> String {
        "loopback".to_string()
    }

    fn free(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.cond.notify_one();
    }
}
