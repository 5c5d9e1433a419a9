//! Fully simulated platform used by the integration tests.

use super::{
    Board, Clock, FaultSwitch, Platform, ResetLine, ScriptedPower, SimClock, SimImu,
    SimMagnetometer, SimRadio, WatchdogLine,
};
use crate::fault::ResetReason;
use crate::storage::MemoryStorage;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Watchdog input that records the clock reading of every kick.
#[derive(Debug, Clone)]
pub struct SimWatchdogLine {
    clock: SimClock,
    kicks: Rc<RefCell<Vec<Duration>>>,
    expired: Rc<Cell<bool>>,
}

impl SimWatchdogLine {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            kicks: Rc::new(RefCell::new(Vec::new())),
            expired: Rc::new(Cell::new(false)),
        }
    }

    /// Make the line report that the watchdog caused the last reset.
    pub fn set_expired_before_boot(&self, expired: bool) {
        self.expired.set(expired);
    }

    pub fn kicks(&self) -> Vec<Duration> {
        self.kicks.borrow().clone()
    }

    pub fn kick_count(&self) -> usize {
        self.kicks.borrow().len()
    }

    /// Largest distance between consecutive kicks, including the time since
    /// the last kick up to now.
    pub fn max_gap(&self) -> Duration {
        let kicks = self.kicks.borrow();
        let between = kicks
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]))
            .max()
            .unwrap_or_default();
        let trailing = kicks
            .last()
            .map(|last| self.clock.now().saturating_sub(*last))
            .unwrap_or_default();
        between.max(trailing)
    }
}

impl WatchdogLine for SimWatchdogLine {
    fn kick(&mut self) {
        self.kicks.borrow_mut().push(self.clock.now());
    }

    fn expired_before_boot(&self) -> bool {
        self.expired.get()
    }
}

/// Reset line that records reasons instead of resetting the process.
#[derive(Debug, Clone, Default)]
pub struct SimResetLine {
    resets: Rc<RefCell<Vec<ResetReason>>>,
}

impl SimResetLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resets(&self) -> Vec<ResetReason> {
        self.resets.borrow().clone()
    }
}

impl ResetLine for SimResetLine {
    fn reset(&mut self, reason: ResetReason) {
        self.resets.borrow_mut().push(reason);
    }
}

pub struct SimPlatform;

impl Platform for SimPlatform {
    type Clock = SimClock;
    type Radio = SimRadio;
    type Storage = MemoryStorage;
    type Watchdog = SimWatchdogLine;
    type Power = ScriptedPower;
    type Imu = SimImu;
    type Magnetometer = SimMagnetometer;
    type Reset = SimResetLine;
}

/// Test-side handles onto a simulated board.
#[derive(Debug, Clone)]
pub struct SimHandles {
    pub clock: SimClock,
    pub radio: SimRadio,
    pub storage: MemoryStorage,
    pub watchdog: SimWatchdogLine,
    pub power: ScriptedPower,
    pub imu: FaultSwitch,
    pub magnetometer: FaultSwitch,
}

/// Assemble a simulated board around an existing store. Passing the same
/// store to a second board models a reset: only durable state survives.
pub fn sim_board(storage: MemoryStorage, power: ScriptedPower) -> (Board<SimPlatform>, SimHandles) {
    let clock = SimClock::new();
    let radio = SimRadio::new(clock.clone());
    let watchdog = SimWatchdogLine::new(clock.clone());
    let imu = SimImu::new();
    let magnetometer = SimMagnetometer::new();

    let handles = SimHandles {
        clock: clock.clone(),
        radio: radio.clone(),
        storage: storage.clone(),
        watchdog: watchdog.clone(),
        power: power.clone(),
        imu: imu.fault_switch(),
        magnetometer: magnetometer.fault_switch(),
    };

    let board = Board {
        clock,
        radio,
        storage,
        watchdog,
        power,
        imu,
        magnetometer,
    };
    (board, handles)
}
