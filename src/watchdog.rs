use crate::config::{ConfigError, WatchdogConfig};
use crate::subsystems::{Clock, WatchdogLine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogStats {
    pub pets: u64,
    pub longest_gap_ms: u64,
    /// Pets that arrived after the hardware timeout had already elapsed.
    pub late_pets: u32,
}

/// Services the external hardware watchdog.
///
/// The guard owns the watchdog line. Every blocking path in the core calls
/// [`WatchdogGuard::pet`] at least once per [`WatchdogGuard::pet_interval`].
#[derive(Debug)]
pub struct WatchdogGuard<W, C> {
    line: W,
    clock: C,
    timeout: Duration,
    pet_interval: Duration,
    last_pet: Option<Duration>,
    stats: WatchdogStats,
}

impl<W: WatchdogLine, C: Clock> WatchdogGuard<W, C> {
    /// Fails unless the pet interval is strictly below half the timeout.
    pub fn new(line: W, clock: C, config: &WatchdogConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            line,
            clock,
            timeout: config.timeout(),
            pet_interval: config.pet_interval(),
            last_pet: None,
            stats: WatchdogStats::default(),
        })
    }

    pub fn pet(&mut self) {
        let now = self.clock.now();
        if let Some(last) = self.last_pet {
            let gap = now.saturating_sub(last);
            let gap_ms = gap.as_millis() as u64;
            if gap_ms > self.stats.longest_gap_ms {
                self.stats.longest_gap_ms = gap_ms;
            }
            if gap >= self.timeout {
                self.stats.late_pets += 1;
                warn!(
                    gap_ms,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Watchdog pet arrived after the hardware timeout"
                );
            }
        }

        self.line.kick();
        self.last_pet = Some(now);
        self.stats.pets += 1;
        trace!(uptime_ms = now.as_millis() as u64, "Watchdog pet");
    }

    pub fn pet_interval(&self) -> Duration {
        self.pet_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn caused_last_reset(&self) -> bool {
        self.line.expired_before_boot()
    }

    pub fn since_last_pet(&self) -> Option<Duration> {
        self.last_pet.map(|last| self.clock.now().saturating_sub(last))
    }

    pub fn stats(&self) -> &WatchdogStats {
        &self.stats
    }
}
