use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time since boot plus the one blocking primitive the core is
/// allowed to use.
pub trait Clock {
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { boot: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.boot.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Default)]
struct SimClockState {
    now: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

/// Simulated clock. Sleeping advances time instantly and is recorded so tests
/// can inspect every uninterrupted span.
///
/// Clones share the same timeline.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    state: Rc<SimClockState>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance time without recording a sleep (bus transfers, radio polling).
    pub fn advance(&self, duration: Duration) {
        self.state.now.set(self.state.now.get() + duration);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.sleeps.borrow().clone()
    }

    pub fn longest_sleep(&self) -> Duration {
        self.state.sleeps.borrow().iter().copied().max().unwrap_or_default()
    }

    pub fn total_slept(&self) -> Duration {
        self.state.sleeps.borrow().iter().sum()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.state.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.state.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}
