//! Collaborator interfaces consumed by the flight core.
//!
//! Everything the core touches outside its own memory goes through one of the
//! traits in this module: the clock, the radio transceiver, the watchdog input
//! line, the reset line and the sensors. The durable store contract lives in
//! [`crate::storage`]. Simulated implementations used by the flight binary
//! and the test suite sit in the submodules.

pub mod clock;
pub mod comms;
pub mod power;
pub mod sensors;
pub mod sim;

pub use clock::{Clock, SimClock, SystemClock};
pub use comms::{Modulation, RadioError, RadioPacket, SimRadio, Transceiver, UdpTransceiver};
pub use power::{PowerTelemetry, ScriptedPower, SimulatedEps};
pub use sensors::{ImuReading, SimImu, SimMagnetometer, Vector3};

use crate::fault::ResetReason;
use crate::storage::DurableStorage;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

/// Fault states a simulated device can be forced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    Degraded,
    Failed,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("device did not respond")]
    NotResponding,
    #[error("bus transaction failed")]
    Bus,
    #[error("reading outside the physical range of the device")]
    OutOfRange,
}

/// A device that produces one reading per call.
pub trait Sensor {
    type Reading;

    fn read(&mut self) -> Result<Self::Reading, HardwareError>;
}

/// The input of the external hardware watchdog timer.
pub trait WatchdogLine {
    /// Restart the hardware countdown.
    fn kick(&mut self);

    /// Whether the reset-cause register blames this watchdog for the last
    /// reset. Lines without such a register report `false`.
    fn expired_before_boot(&self) -> bool {
        false
    }
}

/// Forces a hardware reset of the flight computer.
///
/// On flight hardware this never returns. Simulated lines record the reason and
/// return so the caller can re-enter boot.
pub trait ResetLine {
    fn reset(&mut self, reason: ResetReason);
}

/// Bundles the concrete collaborator types of one flight computer.
pub trait Platform {
    type Clock: Clock + Clone;
    type Radio: Transceiver;
    type Storage: DurableStorage;
    type Watchdog: WatchdogLine;
    type Power: Sensor<Reading = PowerTelemetry>;
    type Imu: Sensor<Reading = ImuReading>;
    type Magnetometer: Sensor<Reading = Vector3>;
    type Reset: ResetLine;
}

/// Collaborator instances handed to boot.
///
/// The reset line is deliberately absent: it stays with the top-level handler
/// that decides between resetting and halting.
pub struct Board<P: Platform> {
    pub clock: P::Clock,
    pub radio: P::Radio,
    pub storage: P::Storage,
    pub watchdog: P::Watchdog,
    pub power: P::Power,
    pub imu: P::Imu,
    pub magnetometer: P::Magnetometer,
}

/// Shared switch used to force a simulated device into a fault state after it
/// has been moved into the flight core.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    state: Rc<Cell<Option<FaultType>>>,
}

impl FaultSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: FaultType) {
        self.state.set(Some(fault));
    }

    pub fn clear(&self) {
        self.state.set(None);
    }

    pub fn current(&self) -> Option<FaultType> {
        self.state.get()
    }

    /// Maps the fault state to the error a read should report, if any.
    pub fn check(&self) -> Result<(), HardwareError> {
        match self.state.get() {
            None | Some(FaultType::Degraded) => Ok(()),
            Some(FaultType::Failed) => Err(HardwareError::Bus),
            Some(FaultType::Offline) => Err(HardwareError::NotResponding),
        }
    }
}
