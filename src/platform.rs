//! The injected platform: timers and deferred-op runners.
//!
//! The engine never talks to an OS scheduler directly. Everything
//! time- or queue-shaped is reached through [`Platform`], so the same engine
//! runs under a production scheduler thread (see the `strata-rt` crate), an
//! async executor binding, or a hand-pumped fake in tests.
//!
//! Handlers are registered at allocation time and invoked by the platform on
//! whatever context it dispatches from; the engine's own locking makes those
//! dispatch contexts safe.

use std::sync::Arc;
use std::time::Duration;

/// Receives timer expirations for one timer handle.
pub trait TimerHandler: Send + Sync {
    /// The timer armed via [`Timer::start`] has expired.
    fn timeout(&self);
}

/// Receives dispatches for one runner handle.
pub trait RunnerHandler: Send + Sync {
    /// A dispatch requested via [`Runner::run`] is being delivered.
    fn run(&self);
}

/// A one-shot, re-armable timer.
pub trait Timer: Send + Sync {
    /// Arm (or re-arm) the timer to fire once after `timeout`.
    fn start(&self, timeout: Duration);

    /// Stop the timer, with confirmation.
    ///
    /// Returns `false` if the timer is idle (not armed and no expiration in
    /// flight); `done` is discarded and the caller may proceed immediately.
    /// Returns `true` if the timer was armed or mid-fire; `done` will be
    /// invoked exactly once, after any in-flight [`TimerHandler::timeout`]
    /// call has returned and the timer can no longer fire.
    ///
    /// This is the drain primitive the engine relies on before releasing its
    /// resources: a late expiration must never observe a torn-down stream.
    fn stop_with_done(&self, done: Box<dyn FnOnce() + Send>) -> bool;
}

/// A reusable deferred-work slot.
pub trait Runner: Send + Sync {
    /// Enqueue one dispatch of the registered [`RunnerHandler`].
    ///
    /// The handler runs from the platform's dispatch context, never from
    /// inside this call. Callers serialize their own `run` requests; the
    /// engine never has more than one outstanding.
    fn run(&self);
}

/// Factory for the platform resources an engine instance owns.
pub trait Platform: Send + Sync {
    /// Allocate a timer that delivers expirations to `handler`.
    fn new_timer(&self, handler: Arc<dyn TimerHandler>) -> Arc<dyn Timer>;

    /// Allocate a runner that delivers dispatches to `handler`.
    fn new_runner(&self, handler: Arc<dyn RunnerHandler>) -> Arc<dyn Runner>;
}
