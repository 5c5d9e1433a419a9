use super::{FaultSwitch, HardwareError, Sensor};
use serde::{Deserialize, Serialize};

/// Three-axis reading in the body frame.
pub type Vector3 = [f32; 3];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// m/s^2
    pub acceleration: Vector3,
    /// rad/s
    pub gyro: Vector3,
}

const TUMBLE_RATE_RAD_S: f32 = 0.02;
const EARTH_FIELD_UT: f32 = 42.0;

/// Slowly tumbling IMU. Each read advances the attitude by one step.
#[derive(Debug, Clone, Default)]
pub struct SimImu {
    step: u32,
    fault: FaultSwitch,
}

impl SimImu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fault_switch(&self) -> FaultSwitch {
        self.fault.clone()
    }
}

impl Sensor for SimImu {
    type Reading = ImuReading;

    fn read(&mut self) -> Result<ImuReading, HardwareError> {
        self.fault.check()?;
        self.step = self.step.wrapping_add(1);
        let angle = self.step as f32 * TUMBLE_RATE_RAD_S;

        Ok(ImuReading {
            acceleration: [0.01 * angle.sin(), 0.01 * angle.cos(), 0.0],
            gyro: [TUMBLE_RATE_RAD_S, 0.5 * TUMBLE_RATE_RAD_S, 0.0],
        })
    }
}

/// Magnetometer reporting a field vector rotating with the tumble.
#[derive(Debug, Clone, Default)]
pub struct SimMagnetometer {
    step: u32,
    fault: FaultSwitch,
}

impl SimMagnetometer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fault_switch(&self) -> FaultSwitch {
        self.fault.clone()
    }
}

impl Sensor for SimMagnetometer {
    type Reading = Vector3;

    fn read(&mut self) -> Result<Vector3, HardwareError> {
        self.fault.check()?;
        self.step = self.step.wrapping_add(1);
        let angle = self.step as f32 * TUMBLE_RATE_RAD_S;

        Ok([
            EARTH_FIELD_UT * angle.cos(),
            EARTH_FIELD_UT * angle.sin(),
            0.25 * EARTH_FIELD_UT,
        ])
    }
}
