//! Flight configuration.
//!
//! Loaded once at boot from JSON. Every field has a default so a partial file
//! only overrides what it names. [`FlightConfig::validate`] rejects anything
//! that would let the watchdog starve or a frame exceed the radio payload.

use crate::power_mode::{ModeTable, PowerThresholds};
use crate::protocol::{MAX_PAYLOAD, MAX_SECRET_LEN};
use crate::scheduler::SleepKind;
use crate::storage::StoreLayout;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_NAME: &str = "satcore-1";
const DEFAULT_LICENSE: &str = "N0CALL";
const DEFAULT_SECRET: &str = "change-me";
pub const MAX_NAME_LEN: usize = 24;

const MIN_SEND_DELAY_MS: u64 = 200;
const STATION_ID_EVERY_SENDS: u32 = 10;
const STATION_ID_INTERVAL_S: u64 = 600;
const MAX_LISTEN_WINDOW_S: u64 = 60;

const WATCHDOG_TIMEOUT_MS: u64 = 16_000;
const WATCHDOG_PET_INTERVAL_MS: u64 = 4_000;

const DUTY_CYCLE_S: u64 = 30;
const SHORT_HIBERNATE_S: u64 = 120;
const LONG_HIBERNATE_S: u64 = 180;
const COOLDOWN_S: u64 = 10;
const BOOT_DELAY_S: u64 = 5;
const REBOOT_AFTER_S: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(String),
    #[error("malformed configuration: {0}")]
    Parse(String),
    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// What the top-level handler does when boot itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootFailurePolicy {
    /// Record the fault and force a hardware reset.
    Reset,
    /// Log and stop; the hardware watchdog eventually resets the board.
    Halt,
}

impl Default for BootFailurePolicy {
    fn default() -> Self {
        BootFailurePolicy::Reset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Call sign transmitted in station identification frames.
    pub license: String,
    /// Shared secret that prefixes every uplinked command.
    pub secret: String,
    pub min_send_delay_ms: u64,
    /// Identify every N payload sends. `None` disables the count trigger.
    pub station_id_every_sends: Option<u32>,
    /// Identify at least this often. `None` disables the time trigger.
    pub station_id_interval_s: Option<u64>,
    pub max_listen_window_s: u64,
    pub jokes: Vec<String>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            license: DEFAULT_LICENSE.to_string(),
            secret: DEFAULT_SECRET.to_string(),
            min_send_delay_ms: MIN_SEND_DELAY_MS,
            station_id_every_sends: Some(STATION_ID_EVERY_SENDS),
            station_id_interval_s: Some(STATION_ID_INTERVAL_S),
            max_listen_window_s: MAX_LISTEN_WINDOW_S,
            jokes: vec![
                "Why did the satellite break up with the ground station? Too much distance.".to_string(),
                "I would tell you a UDP joke, but you might not get it.".to_string(),
                "There are 10 kinds of satellites: those that understand binary and those that tumble.".to_string(),
            ],
        }
    }
}

impl RadioConfig {
    pub fn min_send_delay(&self) -> Duration {
        Duration::from_millis(self.min_send_delay_ms)
    }

    pub fn max_listen_window(&self) -> Duration {
        Duration::from_secs(self.max_listen_window_s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_ms: u64,
    pub pet_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: WATCHDOG_TIMEOUT_MS,
            pet_interval_ms: WATCHDOG_PET_INTERVAL_MS,
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pet_interval(&self) -> Duration {
        Duration::from_millis(self.pet_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pet_interval_ms == 0 {
            return Err(ConfigError::invalid("watchdog.pet_interval_ms", "must be positive"));
        }
        if self.pet_interval_ms.saturating_mul(2) >= self.timeout_ms {
            return Err(ConfigError::invalid(
                "watchdog.pet_interval_ms",
                format!(
                    "{} ms is not below half of the {} ms timeout",
                    self.pet_interval_ms, self.timeout_ms
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub duty_cycle_s: u64,
    pub short_hibernate_s: u64,
    pub long_hibernate_s: u64,
    /// Pause between a loop fault and the forced reset.
    pub cooldown_s: u64,
    /// Loiter before the first transmission after boot.
    pub boot_delay_s: u64,
    /// Scheduled reboot once uptime reaches this. `None` disables it.
    pub reboot_after_s: Option<u64>,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            duty_cycle_s: DUTY_CYCLE_S,
            short_hibernate_s: SHORT_HIBERNATE_S,
            long_hibernate_s: LONG_HIBERNATE_S,
            cooldown_s: COOLDOWN_S,
            boot_delay_s: BOOT_DELAY_S,
            reboot_after_s: Some(REBOOT_AFTER_S),
        }
    }
}

impl SleepConfig {
    pub fn duration(&self, kind: SleepKind) -> Duration {
        let secs = match kind {
            SleepKind::DutyCycle => self.duty_cycle_s,
            SleepKind::ShortHibernate => self.short_hibernate_s,
            SleepKind::LongHibernate => self.long_hibernate_s,
            SleepKind::Cooldown => self.cooldown_s,
        };
        Duration::from_secs(secs)
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_secs(self.boot_delay_s)
    }

    pub fn reboot_after(&self) -> Option<Duration> {
        self.reboot_after_s.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    pub index: u16,
    pub width_bits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagConfig {
    pub name: String,
    pub slot: String,
    pub bit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub slots: Vec<SlotConfig>,
    pub flags: Vec<FlagConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let slot = |name: &str, index, width_bits| SlotConfig {
            name: name.to_string(),
            index,
            width_bits,
        };
        let flag = |name: &str, bit| FlagConfig {
            name: name.to_string(),
            slot: "flags".to_string(),
            bit,
        };
        Self {
            slots: vec![
                slot("boot_count", 0, 16),
                slot("error_count", 1, 16),
                slot("message_count", 2, 16),
                slot("last_reset", 3, 8),
                slot("flags", 4, 32),
            ],
            flags: vec![flag("wake_override", 0), flag("radio_fsk", 7)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    pub cubesat_name: String,
    pub radio: RadioConfig,
    pub watchdog: WatchdogConfig,
    pub sleep: SleepConfig,
    pub power: PowerThresholds,
    pub modes: ModeTable,
    pub storage: StorageConfig,
    pub boot_failure_policy: BootFailurePolicy,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            cubesat_name: DEFAULT_NAME.to_string(),
            radio: RadioConfig::default(),
            watchdog: WatchdogConfig::default(),
            sleep: SleepConfig::default(),
            power: PowerThresholds::default(),
            modes: ModeTable::default(),
            storage: StorageConfig::default(),
            boot_failure_policy: BootFailurePolicy::default(),
        }
    }
}

impl FlightConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cubesat_name.is_empty() || self.cubesat_name.len() > MAX_NAME_LEN {
            return Err(ConfigError::invalid(
                "cubesat_name",
                format!("must be 1..={} bytes", MAX_NAME_LEN),
            ));
        }

        self.validate_radio()?;
        self.watchdog.validate()?;

        // Two rate-limit waits can run back to back (payload then
        // identification) without a pet in between.
        if self.radio.min_send_delay_ms.saturating_mul(2) >= self.watchdog.pet_interval_ms {
            return Err(ConfigError::invalid(
                "radio.min_send_delay_ms",
                "two send delays must fit inside one watchdog pet interval",
            ));
        }

        self.power.validate()?;
        self.modes.validate(self.radio.max_listen_window())?;
        StoreLayout::resolve(&self.storage)?;
        Ok(())
    }

    fn validate_radio(&self) -> Result<(), ConfigError> {
        let radio = &self.radio;
        if radio.license.is_empty() || radio.license.len() > MAX_PAYLOAD {
            return Err(ConfigError::invalid(
                "radio.license",
                format!("must be 1..={} bytes", MAX_PAYLOAD),
            ));
        }
        if radio.secret.is_empty() || radio.secret.len() > MAX_SECRET_LEN {
            return Err(ConfigError::invalid(
                "radio.secret",
                format!("must be 1..={} bytes", MAX_SECRET_LEN),
            ));
        }
        match (radio.station_id_every_sends, radio.station_id_interval_s) {
            (None, None) => {
                return Err(ConfigError::invalid(
                    "radio.station_id_every_sends",
                    "at least one station identification trigger is required",
                ))
            }
            (Some(0), _) => {
                return Err(ConfigError::invalid("radio.station_id_every_sends", "must be positive"))
            }
            (_, Some(0)) => {
                return Err(ConfigError::invalid("radio.station_id_interval_s", "must be positive"))
            }
            _ => {}
        }
        if radio.max_listen_window_s == 0 {
            return Err(ConfigError::invalid("radio.max_listen_window_s", "must be positive"));
        }
        if let Some(joke) = radio.jokes.iter().find(|j| j.is_empty() || j.len() > MAX_PAYLOAD) {
            return Err(ConfigError::invalid(
                "radio.jokes",
                format!("joke of {} bytes does not fit one frame", joke.len()),
            ));
        }
        Ok(())
    }
}
