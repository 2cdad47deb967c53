use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::stream::StreamEvents;

type ReadHook = Box<dyn FnMut(&Result<Vec<u8>, Error>) + Send>;

struct RecordingEventsState {
    reads: Vec<Result<Vec<u8>, Error>>,
    write_readys: u32,
    urgents: u32,
    /// Consume at most this many bytes per read callback.
    consume_limit: Option<usize>,
    on_read: Option<ReadHook>,
    in_read: bool,
    reentered: bool,
}

/// An event handler that records everything it sees.
///
/// The optional read hook runs outside the recorder's own lock, so a test
/// can call back into the stream (close, write, enable toggles) from inside
/// the read callback: the reentrancy the engine has to survive.
pub struct RecordingEvents {
    state: Mutex<RecordingEventsState>,
}

impl RecordingEvents {
    pub fn new() -> Arc<RecordingEvents> {
        Arc::new(RecordingEvents {
            state: Mutex::new(RecordingEventsState {
                reads: Vec::new(),
                write_readys: 0,
                urgents: 0,
                consume_limit: None,
                on_read: None,
                in_read: false,
                reentered: false,
            }),
        })
    }

    pub fn set_consume_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().consume_limit = limit;
    }

    pub fn set_on_read(&self, hook: ReadHook) {
        self.state.lock().unwrap().on_read = Some(hook);
    }

    pub fn reads(&self) -> Vec<Result<Vec<u8>, Error>> {
        self.state.lock().unwrap().reads.clone()
    }

    /// All successfully read bytes, concatenated.
    pub fn read_bytes(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .reads
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .flatten()
            .copied()
            .collect()
    }

    pub fn read_errors(&self) -> Vec<Error> {
        let state = self.state.lock().unwrap();
        state
            .reads
            .iter()
            .filter_map(|r| r.as_ref().err())
            .cloned()
            .collect()
    }

    pub fn write_readys(&self) -> u32 {
        self.state.lock().unwrap().write_readys
    }

    pub fn urgents(&self) -> u32 {
        self.state.lock().unwrap().urgents
    }

    /// True if a read callback was ever entered while one was in progress.
    pub fn read_reentered(&self) -> bool {
        self.state.lock().unwrap().reentered
    }
}

impl StreamEvents for RecordingEvents {
    fn read(&self, data: Result<&[u8], Error>) -> usize {
        let owned: Result<Vec<u8>, Error> = match data {
            Ok(buf) => Ok(buf.to_vec()),
            Err(err) => Err(err),
        };
        let (consumed, mut hook) = {
            let mut state = self.state.lock().unwrap();
            if state.in_read {
                state.reentered = true;
            }
            state.in_read = true;
            state.reads.push(owned.clone());
            let consumed = match &owned {
                Ok(buf) => match state.consume_limit {
                    Some(limit) => buf.len().min(limit),
                    None => buf.len(),
                },
                Err(_) => 0,
            };
            (consumed, state.on_read.take())
        };
        if let Some(hook) = hook.as_mut() {
            hook(&owned);
        }
        let mut state = self.state.lock().unwrap();
        if state.on_read.is_none() {
            state.on_read = hook;
        }
        state.in_read = false;
        consumed
    }

    fn write_ready(&self) {
        self.state.lock().unwrap().write_readys += 1;
    }

    fn urgent(&self) {
        self.state.lock().unwrap().urgents += 1;
    }
}
