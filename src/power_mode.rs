//! Power classification and the per-mode task tables.

use crate::config::ConfigError;
use crate::scheduler::SleepKind;
use crate::subsystems::PowerTelemetry;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_TASKS: usize = 12;

const CRITICAL_BELOW_V: f32 = 3.5;
const MINIMUM_BELOW_V: f32 = 4.0;
const MAXIMUM_AT_V: f32 = 4.2;
const FULL_CHARGE_MA: f32 = 500.0;
const MIN_PLAUSIBLE_V: f32 = 2.5;
const MAX_PLAUSIBLE_V: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerMode {
    Critical,
    Minimum,
    Normal,
    Maximum,
    /// Telemetry missing or implausible. Listen only.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerThresholds {
    pub critical_below_v: f32,
    pub minimum_below_v: f32,
    pub maximum_at_v: f32,
    /// Charge current required, together with `maximum_at_v`, for maximum mode.
    pub full_charge_ma: f32,
    pub min_plausible_v: f32,
    pub max_plausible_v: f32,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            critical_below_v: CRITICAL_BELOW_V,
            minimum_below_v: MINIMUM_BELOW_V,
            maximum_at_v: MAXIMUM_AT_V,
            full_charge_ma: FULL_CHARGE_MA,
            min_plausible_v: MIN_PLAUSIBLE_V,
            max_plausible_v: MAX_PLAUSIBLE_V,
        }
    }
}

impl PowerThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.min_plausible_v < self.critical_below_v
            && self.critical_below_v < self.minimum_below_v
            && self.minimum_below_v <= self.maximum_at_v
            && self.maximum_at_v < self.max_plausible_v;
        if !ordered {
            return Err(ConfigError::invalid(
                "power",
                "thresholds must satisfy min_plausible < critical < minimum <= maximum < max_plausible",
            ));
        }
        if !(self.full_charge_ma > 0.0) {
            return Err(ConfigError::invalid("power.full_charge_ma", "must be positive"));
        }
        Ok(())
    }
}

/// Map one telemetry sample to a mode. Pure: same input, same mode.
pub fn classify(telemetry: Option<&PowerTelemetry>, thresholds: &PowerThresholds) -> PowerMode {
    let Some(sample) = telemetry else {
        return PowerMode::Unknown;
    };
    let volts = sample.battery_voltage_v;
    if !volts.is_finite() || volts < thresholds.min_plausible_v || volts > thresholds.max_plausible_v {
        return PowerMode::Unknown;
    }

    if volts < thresholds.critical_below_v {
        PowerMode::Critical
    } else if volts < thresholds.minimum_below_v {
        PowerMode::Minimum
    } else if volts >= thresholds.maximum_at_v
        && sample.charge_current_ma.is_finite()
        && sample.charge_current_ma >= thresholds.full_charge_ma
    {
        PowerMode::Maximum
    } else {
        PowerMode::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    StationId,
    /// Beacon without sensor reads.
    ShortBeacon,
    Beacon,
    Listen,
    StateOfHealth,
    ImuReport,
    Joke,
}

impl Task {
    pub fn transmits(self) -> bool {
        !matches!(self, Task::Listen)
    }

    pub fn is_beacon(self) -> bool {
        matches!(self, Task::ShortBeacon | Task::Beacon)
    }
}

pub type TaskList = Vec<Task, MAX_TASKS>;

pub fn task_list(tasks: &[Task]) -> TaskList {
    let mut list = TaskList::new();
    for task in tasks.iter().take(MAX_TASKS) {
        let _ = list.push(*task);
    }
    list
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeProfile {
    pub tasks: TaskList,
    /// Length of each `Listen` task.
    pub listen_window_s: u64,
    /// Sleep after the tasks. `None` goes straight to the next iteration.
    pub sleep: Option<SleepKind>,
}

impl ModeProfile {
    pub fn new(tasks: &[Task], listen_window_s: u64, sleep: Option<SleepKind>) -> Self {
        Self {
            tasks: task_list(tasks),
            listen_window_s,
            sleep,
        }
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_secs(self.listen_window_s)
    }
}

/// Task profile for every power mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeTable {
    pub critical: ModeProfile,
    pub minimum: ModeProfile,
    pub normal: ModeProfile,
    pub maximum: ModeProfile,
    pub unknown: ModeProfile,
}

impl Default for ModeTable {
    fn default() -> Self {
        use Task::*;
        Self {
            critical: ModeProfile::new(&[ShortBeacon, Listen], 5, Some(SleepKind::LongHibernate)),
            minimum: ModeProfile::new(&[ShortBeacon, Listen], 5, Some(SleepKind::ShortHibernate)),
            normal: ModeProfile::new(
                &[StationId, Beacon, Listen, StateOfHealth, Listen],
                10,
                Some(SleepKind::DutyCycle),
            ),
            maximum: ModeProfile::new(
                &[StationId, Beacon, Listen, StateOfHealth, Listen, ImuReport, Listen, Joke, Listen],
                10,
                Some(SleepKind::DutyCycle),
            ),
            unknown: ModeProfile::new(&[Listen], 10, None),
        }
    }
}

impl ModeTable {
    pub fn profile(&self, mode: PowerMode) -> &ModeProfile {
        match mode {
            PowerMode::Critical => &self.critical,
            PowerMode::Minimum => &self.minimum,
            PowerMode::Normal => &self.normal,
            PowerMode::Maximum => &self.maximum,
            PowerMode::Unknown => &self.unknown,
        }
    }

    pub fn validate(&self, max_listen_window: Duration) -> Result<(), ConfigError> {
        let named = [
            ("modes.critical", &self.critical),
            ("modes.minimum", &self.minimum),
            ("modes.normal", &self.normal),
            ("modes.maximum", &self.maximum),
            ("modes.unknown", &self.unknown),
        ];
        for (field, profile) in named {
            if profile.tasks.is_empty() {
                return Err(ConfigError::invalid(field, "profile has no tasks"));
            }
            let listens = profile.tasks.iter().any(|t| *t == Task::Listen);
            if listens && (profile.listen_window_s == 0 || profile.listen_window() > max_listen_window) {
                return Err(ConfigError::invalid(
                    field,
                    format!(
                        "listen window {} s outside 1..={} s",
                        profile.listen_window_s,
                        max_listen_window.as_secs()
                    ),
                ));
            }
            // The beacon must go out before the first listen window opens.
            if let Some(first_listen) = profile.tasks.iter().position(|t| *t == Task::Listen) {
                if profile.tasks[first_listen..].iter().any(|t| t.is_beacon()) {
                    return Err(ConfigError::invalid(field, "beacon scheduled after the first listen"));
                }
            }
        }

        if let Some(task) = self.unknown.tasks.iter().find(|t| t.transmits()) {
            return Err(ConfigError::invalid(
                "modes.unknown",
                format!("{:?} transmits while power state is unknown", task),
            ));
        }
        if self.unknown.sleep.is_some() {
            return Err(ConfigError::invalid("modes.unknown", "unknown mode must not hibernate"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(volts: f32, charge_ma: f32) -> PowerTelemetry {
        PowerTelemetry::new(volts, charge_ma)
    }

    #[test]
    fn test_classification_table() {
        let thresholds = PowerThresholds::default();
        assert_eq!(classify(Some(&sample(3.2, 0.0)), &thresholds), PowerMode::Critical);
        assert_eq!(classify(Some(&sample(3.8, 0.0)), &thresholds), PowerMode::Minimum);
        assert_eq!(classify(Some(&sample(4.1, 0.0)), &thresholds), PowerMode::Normal);
        assert_eq!(classify(Some(&sample(4.3, 600.0)), &thresholds), PowerMode::Maximum);
    }

    #[test]
    fn test_high_voltage_without_charge_is_normal() {
        let thresholds = PowerThresholds::default();
        assert_eq!(classify(Some(&sample(4.3, 100.0)), &thresholds), PowerMode::Normal);
        assert_eq!(classify(Some(&sample(4.3, f32::NAN)), &thresholds), PowerMode::Normal);
    }

    #[test]
    fn test_missing_or_implausible_telemetry_is_unknown() {
        let thresholds = PowerThresholds::default();
        assert_eq!(classify(None, &thresholds), PowerMode::Unknown);
        assert_eq!(classify(Some(&sample(f32::NAN, 0.0)), &thresholds), PowerMode::Unknown);
        assert_eq!(classify(Some(&sample(0.0, 0.0)), &thresholds), PowerMode::Unknown);
        assert_eq!(classify(Some(&sample(12.0, 0.0)), &thresholds), PowerMode::Unknown);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let thresholds = PowerThresholds::default();
        for millivolts in (2400..5200).step_by(50) {
            let reading = sample(millivolts as f32 / 1000.0, 550.0);
            let first = classify(Some(&reading), &thresholds);
            for _ in 0..3 {
                assert_eq!(classify(Some(&reading), &thresholds), first);
            }
        }
    }

    #[test]
    fn test_default_table_is_valid() {
        let table = ModeTable::default();
        assert!(table.validate(Duration::from_secs(60)).is_ok());
        assert_eq!(table.profile(PowerMode::Unknown).tasks.as_slice(), &[Task::Listen]);
        assert_eq!(table.profile(PowerMode::Critical).sleep, Some(SleepKind::LongHibernate));
    }

    #[test]
    fn test_beacon_after_listen_rejected() {
        let mut table = ModeTable::default();
        table.normal = ModeProfile::new(&[Task::Listen, Task::Beacon], 10, Some(SleepKind::DutyCycle));
        assert!(table.validate(Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_listen_window_bounded_by_radio_limit() {
        let table = ModeTable::default();
        assert!(table.validate(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let mut thresholds = PowerThresholds::default();
        thresholds.minimum_below_v = 3.4;
        assert!(thresholds.validate().is_err());
    }
}
