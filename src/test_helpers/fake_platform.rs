use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::platform::{Platform, Runner, RunnerHandler, Timer, TimerHandler};

struct FakeTimer {
    handler: Arc<dyn TimerHandler>,
    armed: Mutex<Option<Duration>>,
    drains: Arc<Mutex<u32>>,
}

impl Timer for FakeTimer {
    fn start(&self, timeout: Duration) {
        *self.armed.lock().unwrap() = Some(timeout);
    }

    fn stop_with_done(&self, done: Box<dyn FnOnce() + Send>) -> bool {
        *self.drains.lock().unwrap() += 1;
        let was_armed = self.armed.lock().unwrap().take().is_some();
        if was_armed {
            // No real dispatch context here; the timer is quiesced as soon
            // as it is disarmed, so confirm synchronously.
            done();
        }
        was_armed
    }
}

struct FakeRunner {
    handler: Arc<dyn RunnerHandler>,
    pending: Mutex<bool>,
}

impl Runner for FakeRunner {
    fn run(&self) {
        *self.pending.lock().unwrap() = true;
    }
}

struct FakePlatformState {
    timers: Vec<Weak<FakeTimer>>,
    runners: Vec<Weak<FakeRunner>>,
}

/// A platform whose runner and timer dispatches happen only when the test
/// pumps them. Handles are held weakly, so a freed engine's timer and
/// runner really disappear.
pub struct FakePlatform {
    state: Mutex<FakePlatformState>,
    drains: Arc<Mutex<u32>>,
}

impl FakePlatform {
    pub fn new() -> Arc<FakePlatform> {
        Arc::new(FakePlatform {
            state: Mutex::new(FakePlatformState {
                timers: Vec::new(),
                runners: Vec::new(),
            }),
            drains: Arc::new(Mutex::new(0)),
        })
    }

    /// Dispatch every pending runner. Returns how many dispatches ran.
    pub fn pump_runners(&self) -> u32 {
        let runners: Vec<Arc<FakeRunner>> = {
            let state = self.state.lock().unwrap();
            state.runners.iter().filter_map(Weak::upgrade).collect()
        };
        let mut dispatched = 0;
        for runner in runners {
            let ready = std::mem::take(&mut *runner.pending.lock().unwrap());
            if ready {
                runner.handler.run();
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Expire every armed timer. Returns how many fired.
    pub fn fire_timers(&self) -> u32 {
        let timers: Vec<Arc<FakeTimer>> = {
            let state = self.state.lock().unwrap();
            state.timers.iter().filter_map(Weak::upgrade).collect()
        };
        let mut fired = 0;
        for timer in timers {
            let armed = timer.armed.lock().unwrap().take();
            if armed.is_some() {
                timer.handler.timeout();
                fired += 1;
            }
        }
        fired
    }

    /// The timeout the (single) timer is currently armed with, if any.
    pub fn armed_timeout(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .timers
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|t| *t.armed.lock().unwrap())
    }

    /// True while the engine still holds its timer handle.
    pub fn timer_alive(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.timers.iter().any(|t| t.upgrade().is_some())
    }

    /// True while the engine still holds its runner handle.
    pub fn runner_alive(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.runners.iter().any(|r| r.upgrade().is_some())
    }

    /// Total `stop_with_done` calls across all timers ever allocated.
    pub fn timer_drains(&self) -> u32 {
        *self.drains.lock().unwrap()
    }
}

impl Platform for FakePlatform {
    fn new_timer(&self, handler: Arc<dyn TimerHandler>) -> Arc<dyn Timer> {
        let timer = Arc::new(FakeTimer {
            handler,
            armed: Mutex::new(None),
            drains: Arc::clone(&self.drains),
        });
        self.state.lock().unwrap().timers.push(Arc::downgrade(&timer));
        timer
    }

    fn new_runner(&self, handler: Arc<dyn RunnerHandler>) -> Arc<dyn Runner> {
        let runner = Arc::new(FakeRunner {
            handler,
            pending: Mutex::new(false),
        });
        self.state
            .lock()
            .unwrap()
            .runners
            .push(Arc::downgrade(&runner));
        runner
    }
}
