use crate::channel::PacketChannel;
use crate::config::{ConfigError, FlightConfig};
use crate::fault::{FaultClass, FaultLog, ResetReason};
use crate::storage::{PersistentStore, StoreLayout};
use crate::subsystems::{Clock, Platform};
use crate::watchdog::WatchdogGuard;
use std::fmt;
use std::time::Duration;

/// Shared services handed to every flight component.
///
/// Everything in here is either a handle onto hardware or derived from the
/// persistent store at boot, so a reset loses nothing that matters.
pub struct FlightContext<P: Platform> {
    pub clock: P::Clock,
    pub watchdog: WatchdogGuard<P::Watchdog, P::Clock>,
    pub store: PersistentStore<P::Storage>,
    pub layout: StoreLayout,
    pub channel: PacketChannel<P::Radio, P::Clock>,
    pub faults: FaultLog,
    /// Reason recorded for the reset that led to this boot.
    pub boot_reason: ResetReason,
}

impl<P: Platform> FlightContext<P> {
    pub fn new(
        config: &FlightConfig,
        clock: P::Clock,
        radio: P::Radio,
        storage: P::Storage,
        watchdog: P::Watchdog,
    ) -> Result<Self, ConfigError> {
        let layout = StoreLayout::resolve(&config.storage)?;
        let watchdog = WatchdogGuard::new(watchdog, clock.clone(), &config.watchdog)?;
        let channel = PacketChannel::new(radio, clock.clone(), &config.radio, &layout)?;

        Ok(Self {
            clock,
            watchdog,
            store: PersistentStore::new(storage),
            layout,
            channel,
            faults: FaultLog::new(),
            boot_reason: ResetReason::Uncontrolled,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now()
    }

    pub fn record_fault(&mut self, class: FaultClass, message: impl fmt::Display) -> u32 {
        let uptime = self.clock.now();
        self.faults.record(class, uptime, message)
    }
}
