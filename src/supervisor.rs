//! Boot sequence, the power-mode-driven main loop and the single top-level
//! fault handler.

use crate::config::{BootFailurePolicy, ConfigError, FlightConfig};
use crate::context::FlightContext;
use crate::dispatcher::{CommandDispatcher, ListenPolicy, LoopError};
use crate::fault::{FaultClass, ResetReason};
use crate::power_mode::{classify, PowerMode, Task};
use crate::scheduler::{SleepKind, SleepReport, SleepScheduler};
use crate::storage::StorageError;
use crate::subsystems::{Board, Platform, PowerTelemetry, ResetLine, Sensor};
use crate::telemetry::{BeaconBuilder, BeaconKind, HealthReport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("boot bookkeeping failed: {0}")]
    Storage(#[from] StorageError),
}

/// How the flight software stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Reset(ResetReason),
    /// Boot failed under [`BootFailurePolicy::Halt`].
    Halted,
}

#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub iteration: u64,
    pub mode: Option<PowerMode>,
    pub tasks_run: u8,
    pub slept: Option<SleepReport>,
    pub reset: Option<ResetReason>,
}

pub struct PowerSupervisor<P: Platform> {
    config: FlightConfig,
    ctx: FlightContext<P>,
    power: P::Power,
    beacon: BeaconBuilder<P::Imu, P::Magnetometer>,
    dispatcher: CommandDispatcher,
    sleeper: SleepScheduler,
    iterations: u64,
    last_mode: Option<PowerMode>,
    pending_reset: Option<ResetReason>,
}

impl<P: Platform> PowerSupervisor<P> {
    /// Validate configuration, update boot bookkeeping, loiter, then run the
    /// initial beacon and listen pass. A configuration that gets past the
    /// store layout and watchdog checks but fails validation is recorded
    /// like any other boot fault.
    pub fn boot(config: FlightConfig, board: Board<P>) -> Result<Self, BootError> {
        let Board {
            clock,
            radio,
            storage,
            watchdog,
            power,
            imu,
            magnetometer,
        } = board;
        let mut ctx = FlightContext::<P>::new(&config, clock, radio, storage, watchdog)?;
        ctx.watchdog.pet();

        if let Err(e) = config.validate() {
            Self::record_boot_fault(&mut ctx, config.boot_failure_policy, FaultClass::Config, &e);
            return Err(e.into());
        }
        let boot_count = match Self::start_of_day(&mut ctx) {
            Ok(count) => count,
            Err(e) => {
                Self::record_boot_fault(&mut ctx, config.boot_failure_policy, FaultClass::CriticalLoop, &e);
                return Err(e.into());
            }
        };
        info!(
            name = %config.cubesat_name,
            boot_count,
            boot_reason = %ctx.boot_reason,
            modulation = ?ctx.channel.modulation(),
            software_version = env!("CARGO_PKG_VERSION"),
            "Booting"
        );

        let dispatcher = CommandDispatcher::new(&config)?;
        let beacon = BeaconBuilder::new(config.cubesat_name.clone(), imu, magnetometer);
        let sleeper = SleepScheduler::new(config.sleep.clone());

        let mut supervisor = Self {
            config,
            ctx,
            power,
            beacon,
            dispatcher,
            sleeper,
            iterations: 0,
            last_mode: None,
            pending_reset: None,
        };
        supervisor.loiter();
        supervisor.initial_pass();
        Ok(supervisor)
    }

    /// Run until a reset is due, then force it through the reset line.
    pub fn run<R: ResetLine>(&mut self, reset: &mut R) -> ResetReason {
        info!("Entering main loop");
        let reason = loop {
            match self.run_iteration() {
                Ok(IterationReport { reset: Some(reason), .. }) => break reason,
                Ok(_) => {}
                Err(e) => {
                    self.handle_loop_fault(&e);
                    break ResetReason::LoopFault;
                }
            }
        };

        self.record_reset(reason);
        info!(%reason, "Going neutral");
        reset.reset(reason);
        reason
    }

    /// One pass: pet, check the reboot schedule, classify power, run the
    /// mode's tasks, then sleep.
    pub fn run_iteration(&mut self) -> Result<IterationReport, LoopError> {
        self.iterations += 1;
        self.ctx.watchdog.pet();
        let mut report = IterationReport {
            iteration: self.iterations,
            ..IterationReport::default()
        };

        if let Some(reason) = self.pending_reset.take() {
            report.reset = Some(reason);
            return Ok(report);
        }
        if let Some(limit) = self.config.sleep.reboot_after() {
            let uptime = self.ctx.uptime();
            if uptime >= limit {
                info!(uptime_s = uptime.as_secs(), "Scheduled reboot due");
                report.reset = Some(ResetReason::Scheduled);
                return Ok(report);
            }
        }

        let telemetry = self.sample_power();
        let mode = classify(telemetry.as_ref(), &self.config.power);
        if self.last_mode != Some(mode) {
            info!(?mode, previous = ?self.last_mode, "Power mode");
            self.last_mode = Some(mode);
        }
        report.mode = Some(mode);

        let profile = self.config.modes.profile(mode).clone();
        for task in profile.tasks.iter().copied() {
            report.tasks_run += 1;
            if let Some(reason) = self.run_task(task, mode, telemetry.as_ref(), profile.listen_window())? {
                report.reset = Some(reason);
                return Ok(report);
            }
        }

        if let Some(kind) = profile.sleep {
            report.slept = Some(self.sleeper.hibernate(&mut self.ctx, kind));
        }
        Ok(report)
    }

    pub fn context(&self) -> &FlightContext<P> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut FlightContext<P> {
        &mut self.ctx
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    fn start_of_day(ctx: &mut FlightContext<P>) -> Result<u32, StorageError> {
        let boot_count = ctx.store.increment(ctx.layout.boot_count)?;

        let recorded = ResetReason::from_code(ctx.store.get(ctx.layout.last_reset)?)
            .unwrap_or(ResetReason::Uncontrolled);
        ctx.boot_reason = if recorded == ResetReason::Uncontrolled && ctx.watchdog.caused_last_reset() {
            ResetReason::Watchdog
        } else {
            recorded
        };
        // Anything that resets us before the next controlled reset shows up
        // as uncontrolled on the following boot.
        ctx.store.set(ctx.layout.last_reset, ResetReason::Uncontrolled.code())?;

        ctx.channel.restore_modulation(&ctx.store)?;
        Ok(boot_count)
    }

    /// Leave a durable trace of a failed boot: the error counter and, under
    /// the reset policy, `BootFault` as the reason for the coming reset.
    fn record_boot_fault(
        ctx: &mut FlightContext<P>,
        policy: BootFailurePolicy,
        class: FaultClass,
        error: &dyn fmt::Display,
    ) {
        error!(%error, ?class, "Error in boot sequence");
        ctx.record_fault(class, error);
        if let Err(e) = ctx.store.increment(ctx.layout.error_count) {
            warn!(error = %e, "Error counter update failed");
        }
        if policy == BootFailurePolicy::Reset {
            if let Err(e) = ctx.store.set(ctx.layout.last_reset, ResetReason::BootFault.code()) {
                warn!(error = %e, "Could not record boot fault");
            }
        }
    }

    fn loiter(&mut self) {
        let delay = self.config.sleep.boot_delay().as_secs();
        for remaining in (1..=delay).rev() {
            info!(remaining_s = remaining, "Code starting soon");
            self.sleeper.sleep(&mut self.ctx, Duration::from_secs(1));
        }
    }

    /// Beacon then listen, once, before the main loop. Failures here are
    /// counted and logged; the main loop takes over either way.
    fn initial_pass(&mut self) {
        let telemetry = self.sample_power();
        let mode = classify(telemetry.as_ref(), &self.config.power);
        let window = self.config.modes.profile(mode).listen_window();

        let beacon = match mode {
            PowerMode::Unknown => None,
            PowerMode::Critical | PowerMode::Minimum => Some(Task::ShortBeacon),
            PowerMode::Normal | PowerMode::Maximum => Some(Task::Beacon),
        };

        for task in beacon.into_iter().chain([Task::Listen]) {
            match self.run_task(task, mode, telemetry.as_ref(), window) {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    self.pending_reset = Some(reason);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Error in boot sequence");
                    self.ctx.record_fault(FaultClass::CriticalLoop, &e);
                    if let Err(e) = self.ctx.store.increment(self.ctx.layout.error_count) {
                        warn!(error = %e, "Error counter update failed");
                    }
                    return;
                }
            }
        }
        self.ctx.watchdog.pet();
    }

    fn sample_power(&mut self) -> Option<PowerTelemetry> {
        match self.power.read() {
            Ok(sample) => {
                debug!(
                    battery_v = sample.battery_voltage_v,
                    charge_ma = sample.charge_current_ma,
                    "Power telemetry"
                );
                Some(sample)
            }
            Err(e) => {
                warn!(error = %e, "Power telemetry unavailable");
                self.ctx.record_fault(FaultClass::TransientIo, format_args!("power: {}", e));
                None
            }
        }
    }

    /// Returns the reset a task asked for, if any. Transient failures are
    /// logged and swallowed.
    fn run_task(
        &mut self,
        task: Task,
        mode: PowerMode,
        telemetry: Option<&PowerTelemetry>,
        window: Duration,
    ) -> Result<Option<ResetReason>, LoopError> {
        self.ctx.watchdog.pet();
        debug!(?task, ?mode, "Task");

        let outcome = match task {
            Task::StationId => self.ctx.channel.send_station_id(),
            Task::ShortBeacon => self
                .beacon
                .build_and_send(&mut self.ctx, BeaconKind::Short, mode, telemetry)
                .map(|_| ()),
            Task::Beacon => self
                .beacon
                .build_and_send(&mut self.ctx, BeaconKind::Full, mode, telemetry)
                .map(|_| ()),
            Task::StateOfHealth => HealthReport::send(&mut self.ctx).map(|_| ()),
            Task::ImuReport => self.beacon.send_imu_report(&mut self.ctx).map(|_| ()),
            Task::Joke => {
                self.dispatcher.tell_joke(&mut self.ctx)?;
                return Ok(None);
            }
            Task::Listen => {
                let policy = if mode == PowerMode::Unknown {
                    ListenPolicy::Restricted
                } else {
                    ListenPolicy::Full
                };
                let report = self.dispatcher.listen(&mut self.ctx, window, policy)?;
                return Ok(report.reset_requested.then_some(ResetReason::Commanded));
            }
        };

        if let Err(e) = outcome {
            let e = LoopError::escalate(e)?;
            warn!(?task, error = %e, "Task failed");
            self.ctx.record_fault(FaultClass::TransientIo, &e);
        }
        Ok(None)
    }

    fn handle_loop_fault(&mut self, error: &LoopError) {
        error!(%error, "Critical in main loop");
        self.ctx.record_fault(FaultClass::CriticalLoop, error);
        match self.ctx.store.increment(self.ctx.layout.error_count) {
            Ok(count) => info!(error_count = count, "Error counter updated"),
            Err(e) => error!(error = %e, "Error counter update failed"),
        }
        self.sleeper.hibernate(&mut self.ctx, SleepKind::Cooldown);
    }

    fn record_reset(&mut self, reason: ResetReason) {
        if let Err(e) = self.ctx.store.set(self.ctx.layout.last_reset, reason.code()) {
            error!(%reason, error = %e, "Could not record reset reason");
        }
    }
}

/// Top-level entry: boot and fly until a reset, applying the boot failure
/// policy when boot itself fails.
pub fn fly<P: Platform>(config: FlightConfig, board: Board<P>, reset: &mut P::Reset) -> Termination {
    let policy = config.boot_failure_policy;
    match PowerSupervisor::boot(config, board) {
        Ok(mut supervisor) => Termination::Reset(supervisor.run(reset)),
        Err(e) => {
            error!(error = %e, ?policy, "An exception occurred during boot");
            match policy {
                BootFailurePolicy::Reset => {
                    reset.reset(ResetReason::BootFault);
                    Termination::Reset(ResetReason::BootFault)
                }
                BootFailurePolicy::Halt => Termination::Halted,
            }
        }
    }
}
