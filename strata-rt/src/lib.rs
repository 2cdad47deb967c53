//! # Strata Runtime - Scheduler-Thread Platform
//!
//! `strata-rt` provides [`ThreadPlatform`], a ready-made implementation of
//! the `strata` [`Platform`] contract backed by one background scheduler
//! thread. The engine stays runtime-agnostic; this crate makes it runnable
//! without writing a platform by hand.
//!
//! One thread per platform instance services every timer and runner handle
//! allocated from it:
//!
//! - **Runners** are a FIFO queue: each [`Runner::run`] enqueues exactly one
//!   dispatch of the registered handler.
//! - **Timers** are one-shot deadlines; re-arming replaces the deadline.
//!   `stop_with_done` confirmation callbacks run on the scheduler thread,
//!   strictly after any in-flight expiration has returned: the drain
//!   guarantee the engine's teardown depends on.
//!
//! All handler dispatches happen on the scheduler thread, so a platform
//! instance also serializes the deferred work of every stream built on it.
//!
//! ```rust,no_run
//! use strata_rt::ThreadPlatform;
//!
//! let platform = ThreadPlatform::new();
//! // let stream = strata::Stream::client(&*platform, transport, None, events);
//! ```
//!
//! Drop the platform after the streams built on it have finished tearing
//! down; handles allocated from a dropped platform go inert.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use strata::{Platform, Runner, RunnerHandler, Timer, TimerHandler};

struct SchedState {
    run_queue: VecDeque<Weak<RunnerEntry>>,
    timers: Vec<Weak<TimerEntry>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedState>,
    cond: Condvar,
}

impl Shared {
    fn kick(&self) {
        let _guard = self.state.lock().unwrap();
        self.cond.notify_one();
    }
}

struct TimerEntryState {
    deadline: Option<Instant>,
    /// The expiration handler is on the scheduler's stack right now.
    firing: bool,
    /// Stop confirmations awaiting quiescence.
    dones: Vec<Box<dyn FnOnce() + Send>>,
}

struct TimerEntry {
    handler: Arc<dyn TimerHandler>,
    state: Mutex<TimerEntryState>,
    shared: Arc<Shared>,
}

impl Timer for TimerEntry {
    fn start(&self, timeout: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            state.deadline = Some(Instant::now() + timeout);
        }
        self.shared.kick();
    }

    fn stop_with_done(&self, done: Box<dyn FnOnce() + Send>) -> bool {
        let stopping = {
            let mut state = self.state.lock().unwrap();
            if state.firing {
                state.dones.push(done);
                true
            } else if state.deadline.take().is_some() {
                state.dones.push(done);
                true
            } else {
                false
            }
        };
        if stopping {
            self.shared.kick();
        }
        stopping
    }
}

struct RunnerEntry {
    handler: Arc<dyn RunnerHandler>,
    shared: Arc<Shared>,
    weak_self: Weak<RunnerEntry>,
}

impl Runner for RunnerEntry {
    fn run(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.run_queue.push_back(self.weak_self.clone());
        }
        self.shared.kick();
    }
}

/// A [`Platform`] backed by one background scheduler thread.
pub struct ThreadPlatform {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadPlatform {
    /// Start a scheduler thread and return the platform built on it.
    pub fn new() -> Arc<ThreadPlatform> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                run_queue: VecDeque::new(),
                timers: Vec::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("strata-sched".to_string())
            .spawn(move || scheduler_loop(thread_shared))
            .expect("failed to spawn scheduler thread");
        Arc::new(ThreadPlatform {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl Platform for ThreadPlatform {
    fn new_timer(&self, handler: Arc<dyn TimerHandler>) -> Arc<dyn Timer> {
        let entry = Arc::new(TimerEntry {
            handler,
            state: Mutex::new(TimerEntryState {
                deadline: None,
                firing: false,
                dones: Vec::new(),
            }),
            shared: Arc::clone(&self.shared),
        });
        self.shared
            .state
            .lock()
            .unwrap()
            .timers
            .push(Arc::downgrade(&entry));
        entry
    }

    fn new_runner(&self, handler: Arc<dyn RunnerHandler>) -> Arc<dyn Runner> {
        Arc::new_cyclic(|weak: &Weak<RunnerEntry>| RunnerEntry {
            handler,
            shared: Arc::clone(&self.shared),
            weak_self: weak.clone(),
        })
    }
}

impl Drop for ThreadPlatform {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    trace!("scheduler thread up");
    loop {
        // Pick at most one piece of work per pass, always dispatching with
        // no scheduler locks held.
        enum Work {
            Runner(Arc<RunnerEntry>),
            Fire(Arc<TimerEntry>),
            Done(Arc<TimerEntry>),
        }

        let work = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    trace!("scheduler thread shutting down");
                    return;
                }

                if let Some(weak) = state.run_queue.pop_front() {
                    match weak.upgrade() {
                        Some(runner) => break Some(Work::Runner(runner)),
                        None => continue,
                    }
                }

                state.timers.retain(|weak| weak.strong_count() > 0);

                let now = Instant::now();
                let mut next_deadline: Option<Instant> = None;
                let mut picked: Option<Work> = None;
                for weak in &state.timers {
                    let Some(timer) = weak.upgrade() else { continue };
                    let ts = timer.state.lock().unwrap();
                    if !ts.firing && ts.deadline.is_none() && !ts.dones.is_empty() {
                        drop(ts);
                        picked = Some(Work::Done(timer));
                        break;
                    }
                    if let Some(deadline) = ts.deadline {
                        if deadline <= now {
                            drop(ts);
                            picked = Some(Work::Fire(timer));
                            break;
                        }
                        next_deadline = Some(match next_deadline {
                            Some(d) => d.min(deadline),
                            None => deadline,
                        });
                    }
                }
                if picked.is_some() {
                    break picked;
                }

                state = match next_deadline {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        shared.cond.wait_timeout(state, wait).unwrap().0
                    }
                    None => shared.cond.wait(state).unwrap(),
                };
            }
        };

        match work {
            Some(Work::Runner(runner)) => {
                runner.handler.run();
            }
            Some(Work::Fire(timer)) => {
                let due = {
                    let mut ts = timer.state.lock().unwrap();
                    match ts.deadline {
                        // Re-check: a stop or re-arm may have won the race.
                        Some(deadline) if deadline <= Instant::now() => {
                            ts.deadline = None;
                            ts.firing = true;
                            true
                        }
                        _ => false,
                    }
                };
                if due {
                    timer.handler.timeout();
                    let dones = {
                        let mut ts = timer.state.lock().unwrap();
                        ts.firing = false;
                        std::mem::take(&mut ts.dones)
                    };
                    for done in dones {
                        done();
                    }
                }
            }
            Some(Work::Done(timer)) => {
                let dones = {
                    let mut ts = timer.state.lock().unwrap();
                    if ts.firing || ts.deadline.is_some() {
                        Vec::new()
                    } else {
                        std::mem::take(&mut ts.dones)
                    }
                };
                for done in dones {
                    done();
                }
            }
            None => {}
        }
    }
}
