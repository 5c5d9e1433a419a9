//! Downlinked telemetry: beacons, state of health, IMU reports and jokes.
//!
//! All reports are JSON with short keys. Sensor values travel as scaled
//! integers. A beacon whose readings would overflow one frame loses sensor
//! fields to the sentinel until it fits; with every sensor field as the
//! sentinel it fits under any valid configuration.

use crate::channel::TransmitError;
use crate::context::FlightContext;
use crate::fault::{FaultClass, FaultMessage, ResetReason};
use crate::power_mode::PowerMode;
use crate::protocol::{FrameError, FrameKind, MAX_PAYLOAD};
use crate::storage::Counter;
use crate::subsystems::{ImuReading, Modulation, Platform, PowerTelemetry, Sensor, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SENSOR_SENTINEL: &str = "unavailable";

/// m/s^2 to mm/s^2
const ACCEL_SCALE: f32 = 1000.0;
/// rad/s to mrad/s
const GYRO_SCALE: f32 = 1000.0;
/// uT to 0.1 uT
const MAG_SCALE: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unavailable {
    #[serde(rename = "unavailable")]
    Unavailable,
}

/// A telemetry value or the explicit `"unavailable"` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field<T> {
    Value(T),
    Unavailable(Unavailable),
}

impl<T> Field<T> {
    pub fn unavailable() -> Self {
        Field::Unavailable(Unavailable::Unavailable)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Field::Unavailable(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            Field::Unavailable(_) => None,
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Field::unavailable, Field::Value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconKind {
    Full,
    /// Counters and power only; sensors are not read.
    Short,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconSnapshot {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "k")]
    pub kind: BeaconKind,
    #[serde(rename = "bc")]
    pub boot_count: Field<u32>,
    #[serde(rename = "ec")]
    pub error_count: Field<u32>,
    #[serde(rename = "mc")]
    pub message_count: Field<u32>,
    #[serde(rename = "rr")]
    pub last_reset: ResetReason,
    /// Saturates at `u32::MAX`.
    #[serde(rename = "up")]
    pub uptime_s: u32,
    #[serde(rename = "pm")]
    pub power_mode: PowerMode,
    #[serde(rename = "bv")]
    pub battery_mv: Field<u16>,
    #[serde(rename = "cc")]
    pub charge_ma: Field<i16>,
    #[serde(rename = "acc")]
    pub acceleration_mm_s2: Field<[i16; 3]>,
    #[serde(rename = "gyr")]
    pub gyro_mrad_s: Field<[i16; 3]>,
    /// Tenths of a microtesla.
    #[serde(rename = "mag")]
    pub magnetic_field: Field<[i16; 3]>,
    #[serde(rename = "mod")]
    pub modulation: Modulation,
}

impl BeaconSnapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, TransmitError> {
        serde_json::to_vec(self).map_err(|e| TransmitError::Encoding(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode for one frame, replacing sensor fields with the sentinel
    /// (magnetometer, then gyro, then acceleration) while the JSON is too
    /// large. Counters and power are never dropped.
    pub fn to_frame_json(&mut self) -> Result<Vec<u8>, TransmitError> {
        loop {
            let json = self.to_json()?;
            if json.len() <= MAX_PAYLOAD {
                return Ok(json);
            }
            let field = if !self.magnetic_field.is_unavailable() {
                self.magnetic_field = Field::unavailable();
                "mag"
            } else if !self.gyro_mrad_s.is_unavailable() {
                self.gyro_mrad_s = Field::unavailable();
                "gyr"
            } else if !self.acceleration_mm_s2.is_unavailable() {
                self.acceleration_mm_s2 = Field::unavailable();
                "acc"
            } else {
                return Err(FrameError::PayloadTooLarge {
                    len: json.len(),
                    max: MAX_PAYLOAD,
                }
                .into());
            };
            warn!(field, bytes = json.len(), max = MAX_PAYLOAD, "Beacon too large, dropping sensor field");
        }
    }
}

fn scaled(v: Vector3, factor: f32) -> [i16; 3] {
    // Float to int casts saturate and map NaN to zero.
    v.map(|c| (c * factor).round() as i16)
}

fn counter_field<P: Platform>(ctx: &FlightContext<P>, counter: Counter, name: &str) -> Field<u32> {
    match ctx.store.get(counter) {
        Ok(v) => Field::Value(v),
        Err(e) => {
            warn!(counter = name, error = %e, "Counter unreadable for telemetry");
            Field::unavailable()
        }
    }
}

/// Assembles beacons. Each sensor read is isolated: a failure turns that one
/// field into the sentinel and the beacon still goes out.
#[derive(Debug)]
pub struct BeaconBuilder<I, M> {
    name: String,
    imu: I,
    magnetometer: M,
}

impl<I, M> BeaconBuilder<I, M>
where
    I: Sensor<Reading = ImuReading>,
    M: Sensor<Reading = Vector3>,
{
    pub fn new(name: impl Into<String>, imu: I, magnetometer: M) -> Self {
        Self {
            name: name.into(),
            imu,
            magnetometer,
        }
    }

    pub fn build<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        kind: BeaconKind,
        mode: PowerMode,
        power: Option<&PowerTelemetry>,
    ) -> BeaconSnapshot {
        let (acceleration, gyro, magnetic) = match kind {
            BeaconKind::Short => (Field::unavailable(), Field::unavailable(), Field::unavailable()),
            BeaconKind::Full => {
                let (acceleration, gyro) = match self.imu.read() {
                    Ok(reading) => (
                        Field::Value(scaled(reading.acceleration, ACCEL_SCALE)),
                        Field::Value(scaled(reading.gyro, GYRO_SCALE)),
                    ),
                    Err(e) => {
                        warn!(error = %e, "IMU read failed");
                        ctx.record_fault(FaultClass::TransientIo, format_args!("imu: {}", e));
                        (Field::unavailable(), Field::unavailable())
                    }
                };
                let magnetic = match self.magnetometer.read() {
                    Ok(field) => Field::Value(scaled(field, MAG_SCALE)),
                    Err(e) => {
                        warn!(error = %e, "Magnetometer read failed");
                        ctx.record_fault(FaultClass::TransientIo, format_args!("magnetometer: {}", e));
                        Field::unavailable()
                    }
                };
                (acceleration, gyro, magnetic)
            }
        };

        let battery_mv = power
            .map(|p| p.battery_voltage_v * 1000.0)
            .filter(|mv| mv.is_finite())
            .map(|mv| mv.round() as u16);
        let charge_ma = power
            .map(|p| p.charge_current_ma)
            .filter(|ma| ma.is_finite())
            .map(|ma| ma.round() as i16);

        BeaconSnapshot {
            name: self.name.clone(),
            kind,
            boot_count: counter_field(ctx, ctx.layout.boot_count, "boot_count"),
            error_count: counter_field(ctx, ctx.layout.error_count, "error_count"),
            message_count: counter_field(ctx, ctx.layout.message_count, "message_count"),
            last_reset: ctx.boot_reason,
            uptime_s: u32::try_from(ctx.uptime().as_secs()).unwrap_or(u32::MAX),
            power_mode: mode,
            battery_mv: battery_mv.into(),
            charge_ma: charge_ma.into(),
            acceleration_mm_s2: acceleration,
            gyro_mrad_s: gyro,
            magnetic_field: magnetic,
            modulation: ctx.channel.modulation(),
        }
    }

    pub fn build_and_send<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        kind: BeaconKind,
        mode: PowerMode,
        power: Option<&PowerTelemetry>,
    ) -> Result<BeaconSnapshot, TransmitError> {
        let mut snapshot = self.build(ctx, kind, mode, power);
        let json = snapshot.to_frame_json()?;
        ctx.channel.send(FrameKind::Beacon, &json, &mut ctx.store)?;
        info!(?kind, ?mode, bytes = json.len(), "Beacon sent");
        Ok(snapshot)
    }

    /// Downlink the current gyro rates as a data frame.
    pub fn send_imu_report<P: Platform>(&mut self, ctx: &mut FlightContext<P>) -> Result<ImuReport, TransmitError> {
        let gyro = match self.imu.read() {
            Ok(reading) => Field::Value(scaled(reading.gyro, GYRO_SCALE)),
            Err(e) => {
                warn!(error = %e, "IMU read failed");
                ctx.record_fault(FaultClass::TransientIo, format_args!("imu: {}", e));
                Field::unavailable()
            }
        };
        let report = ImuReport {
            uptime_s: ctx.uptime().as_secs(),
            gyro_mrad_s: gyro,
        };
        let json = serde_json::to_vec(&report).map_err(|e| TransmitError::Encoding(e.to_string()))?;
        ctx.channel.send(FrameKind::Data, &json, &mut ctx.store)?;
        debug!("IMU report sent");
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImuReport {
    #[serde(rename = "up")]
    pub uptime_s: u64,
    #[serde(rename = "gyr")]
    pub gyro_mrad_s: Field<[i16; 3]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(rename = "up")]
    pub uptime_s: u64,
    #[serde(rename = "bc")]
    pub boot_count: Field<u32>,
    #[serde(rename = "ec")]
    pub error_count: Field<u32>,
    #[serde(rename = "mc")]
    pub message_count: Field<u32>,
    #[serde(rename = "rr")]
    pub last_reset: ResetReason,
    #[serde(rename = "tx")]
    pub payloads_sent: u32,
    #[serde(rename = "ids")]
    pub station_ids_sent: u32,
    #[serde(rename = "txf")]
    pub send_failures: u32,
    #[serde(rename = "rx")]
    pub frames_received: u32,
    #[serde(rename = "drop")]
    pub frames_dropped: u32,
    #[serde(rename = "wd")]
    pub watchdog_pets: u64,
    #[serde(rename = "faults")]
    pub fault_total: u32,
    #[serde(rename = "last", skip_serializing_if = "Option::is_none", default)]
    pub last_fault: Option<FaultMessage>,
    #[serde(rename = "mod")]
    pub modulation: Modulation,
}

impl HealthReport {
    pub fn collect<P: Platform>(ctx: &FlightContext<P>) -> Self {
        let stats = ctx.channel.stats();
        Self {
            uptime_s: ctx.uptime().as_secs(),
            boot_count: counter_field(ctx, ctx.layout.boot_count, "boot_count"),
            error_count: counter_field(ctx, ctx.layout.error_count, "error_count"),
            message_count: counter_field(ctx, ctx.layout.message_count, "message_count"),
            last_reset: ctx.boot_reason,
            payloads_sent: stats.payloads_sent,
            station_ids_sent: stats.station_ids_sent,
            send_failures: stats.send_failures,
            frames_received: stats.frames_received,
            frames_dropped: stats.frames_dropped,
            watchdog_pets: ctx.watchdog.stats().pets,
            fault_total: ctx.faults.total(),
            last_fault: ctx.faults.last().map(|r| r.message),
            modulation: ctx.channel.modulation(),
        }
    }

    /// JSON no longer than `max` bytes. The last fault message is dropped
    /// first when the report does not fit.
    pub fn to_json(&self, max: usize) -> Result<Vec<u8>, TransmitError> {
        let json = serde_json::to_vec(self).map_err(|e| TransmitError::Encoding(e.to_string()))?;
        if json.len() <= max {
            return Ok(json);
        }
        let trimmed = Self {
            last_fault: None,
            ..self.clone()
        };
        let json = serde_json::to_vec(&trimmed).map_err(|e| TransmitError::Encoding(e.to_string()))?;
        if json.len() <= max {
            Ok(json)
        } else {
            Err(TransmitError::Encoding(format!("health report of {} bytes exceeds {}", json.len(), max)))
        }
    }

    pub fn send<P: Platform>(ctx: &mut FlightContext<P>) -> Result<Self, TransmitError> {
        let report = Self::collect(ctx);
        let json = report.to_json(MAX_PAYLOAD)?;
        ctx.channel.send(FrameKind::Data, &json, &mut ctx.store)?;
        debug!(bytes = json.len(), "State of health sent");
        Ok(report)
    }
}

/// Rotating list of jokes for the joke frame.
#[derive(Debug, Clone, Default)]
pub struct JokeBook {
    jokes: Vec<String>,
    next: usize,
}

impl JokeBook {
    pub fn new(jokes: Vec<String>) -> Self {
        Self { jokes, next: 0 }
    }

    pub fn next_joke(&mut self) -> Option<&str> {
        if self.jokes.is_empty() {
            return None;
        }
        let index = self.next % self.jokes.len();
        self.next = self.next.wrapping_add(1);
        Some(self.jokes[index].as_str())
    }

    /// Send the next joke. Returns `false` when there are none configured.
    pub fn tell<P: Platform>(&mut self, ctx: &mut FlightContext<P>) -> Result<bool, TransmitError> {
        let Some(joke) = self.next_joke() else {
            debug!("No jokes configured");
            return Ok(false);
        };
        ctx.channel.send(FrameKind::Joke, joke.as_bytes(), &mut ctx.store)?;
        Ok(true)
    }
}
