use super::{Clock, FaultSwitch, FaultType, HardwareError, Sensor};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

const NOMINAL_VOLTAGE_MV: f32 = 3900.0;
const CRITICAL_VOLTAGE_MV: f32 = 3300.0;
const MAX_VOLTAGE_MV: f32 = 4250.0;

const LOAD_CURRENT_MA: f32 = 450.0;
const SOLAR_CURRENT_MA: f32 = 900.0;
/// Terminal voltage change per mA of net current per second.
const CHARGE_RATE_MV_PER_MA_S: f32 = 0.0004;
const SUNLIT_FRACTION: f32 = 0.6;

/// One sample of the electrical power system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerTelemetry {
    pub battery_voltage_v: f32,
    /// Net charge current into the battery; negative while discharging.
    pub charge_current_ma: f32,
}

impl PowerTelemetry {
    pub fn new(battery_voltage_v: f32, charge_current_ma: f32) -> Self {
        Self {
            battery_voltage_v,
            charge_current_ma,
        }
    }
}

/// Battery and solar array model driven by orbital phase.
///
/// Voltage integrates net current over the time elapsed between reads, so the
/// model walks through charge and discharge as the simulated orbit moves
/// between sunlight and eclipse.
#[derive(Debug)]
pub struct SimulatedEps<C> {
    clock: C,
    orbit_period: Duration,
    battery_voltage_mv: f32,
    solar_current_ma: f32,
    solar_enabled: bool,
    last_update: Duration,
    fault: FaultSwitch,
}

impl<C: Clock> SimulatedEps<C> {
    pub fn new(clock: C, orbit_period: Duration) -> Self {
        let last_update = clock.now();
        Self {
            clock,
            orbit_period,
            battery_voltage_mv: NOMINAL_VOLTAGE_MV,
            solar_current_ma: 0.0,
            solar_enabled: true,
            last_update,
            fault: FaultSwitch::new(),
        }
    }

    pub fn with_voltage(mut self, millivolts: f32) -> Self {
        self.battery_voltage_mv = millivolts.clamp(CRITICAL_VOLTAGE_MV, MAX_VOLTAGE_MV);
        self
    }

    pub fn set_solar_enabled(&mut self, enabled: bool) {
        self.solar_enabled = enabled;
    }

    pub fn fault_switch(&self) -> FaultSwitch {
        self.fault.clone()
    }

    fn sunlit(&self, now: Duration) -> bool {
        let period = self.orbit_period.as_secs_f32();
        if period <= 0.0 {
            return true;
        }
        let phase = (now.as_secs_f32() % period) / period;
        phase < SUNLIT_FRACTION
    }

    fn update(&mut self) {
        let now = self.clock.now();
        let dt_s = now.saturating_sub(self.last_update).as_secs_f32();
        self.last_update = now;

        self.solar_current_ma = if self.solar_enabled && self.sunlit(now) {
            let efficiency = match self.fault.current() {
                Some(FaultType::Degraded) => 0.5,
                _ => 1.0,
            };
            SOLAR_CURRENT_MA * efficiency
        } else {
            0.0
        };

        let net_current = self.solar_current_ma - LOAD_CURRENT_MA;
        self.battery_voltage_mv = (self.battery_voltage_mv
            + net_current * dt_s * CHARGE_RATE_MV_PER_MA_S)
            .clamp(CRITICAL_VOLTAGE_MV, MAX_VOLTAGE_MV);
    }
}

impl<C: Clock> Sensor for SimulatedEps<C> {
    type Reading = PowerTelemetry;

    fn read(&mut self) -> Result<PowerTelemetry, HardwareError> {
        self.fault.check()?;
        self.update();

        Ok(PowerTelemetry {
            battery_voltage_v: self.battery_voltage_mv / 1000.0,
            charge_current_ma: self.solar_current_ma - LOAD_CURRENT_MA,
        })
    }
}

#[derive(Debug)]
struct ScriptState {
    queued: VecDeque<Result<PowerTelemetry, HardwareError>>,
    steady: Result<PowerTelemetry, HardwareError>,
}

/// Power sensor returning queued readings, then a steady value.
///
/// Clones share the script so tests can keep a handle after the sensor has
/// been moved into the flight core.
#[derive(Debug, Clone)]
pub struct ScriptedPower {
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedPower {
    pub fn steady(reading: PowerTelemetry) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScriptState {
                queued: VecDeque::new(),
                steady: Ok(reading),
            })),
        }
    }

    pub fn failing(error: HardwareError) -> Self {
        let power = Self::steady(PowerTelemetry::new(0.0, 0.0));
        power.set_steady(Err(error));
        power
    }

    pub fn set_steady(&self, reading: Result<PowerTelemetry, HardwareError>) {
        self.state.borrow_mut().steady = reading;
    }

    pub fn push(&self, reading: Result<PowerTelemetry, HardwareError>) {
        self.state.borrow_mut().queued.push_back(reading);
    }
}

impl Sensor for ScriptedPower {
    type Reading = PowerTelemetry;

    fn read(&mut self) -> Result<PowerTelemetry, HardwareError> {
        let mut state = self.state.borrow_mut();
        match state.queued.pop_front() {
            Some(reading) => reading,
            None => state.steady,
        }
    }
}
