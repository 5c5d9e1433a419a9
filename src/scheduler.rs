use crate::config::SleepConfig;
use crate::context::FlightContext;
use crate::subsystems::{Clock, Platform};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SleepKind {
    DutyCycle,
    ShortHibernate,
    LongHibernate,
    /// Pause after a loop fault, before the forced reset.
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SleepReport {
    pub requested: Duration,
    pub slept: Duration,
    pub intervals: u32,
    pub woke_early: bool,
}

/// Watchdog-safe sleep.
///
/// A sleep is cut into spans no longer than the watchdog pet interval with a
/// pet after each one. Before every span the durable `wake_override` flag is
/// checked; a set flag is cleared and ends the sleep early.
#[derive(Debug, Clone)]
pub struct SleepScheduler {
    durations: SleepConfig,
}

impl SleepScheduler {
    pub fn new(durations: SleepConfig) -> Self {
        Self { durations }
    }

    pub fn duration(&self, kind: SleepKind) -> Duration {
        self.durations.duration(kind)
    }

    pub fn hibernate<P: Platform>(&self, ctx: &mut FlightContext<P>, kind: SleepKind) -> SleepReport {
        let duration = self.duration(kind);
        info!(?kind, seconds = duration.as_secs(), "Sleeping");
        self.sleep(ctx, duration)
    }

    pub fn sleep<P: Platform>(&self, ctx: &mut FlightContext<P>, duration: Duration) -> SleepReport {
        let span_limit = ctx.watchdog.pet_interval();
        let mut report = SleepReport {
            requested: duration,
            ..SleepReport::default()
        };

        ctx.watchdog.pet();
        let mut remaining = duration;
        while !remaining.is_zero() {
            if Self::wake_requested(ctx) {
                report.woke_early = true;
                info!(
                    slept_s = report.slept.as_secs(),
                    requested_s = duration.as_secs(),
                    "Wake override set, ending sleep early"
                );
                break;
            }

            let span = remaining.min(span_limit);
            ctx.clock.sleep(span);
            ctx.watchdog.pet();

            remaining -= span;
            report.slept += span;
            report.intervals += 1;
        }

        debug!(
            slept_ms = report.slept.as_millis() as u64,
            intervals = report.intervals,
            "Sleep finished"
        );
        report
    }

    /// Reads and consumes the wake flag. A storage failure keeps sleeping.
    fn wake_requested<P: Platform>(ctx: &mut FlightContext<P>) -> bool {
        let flag = ctx.layout.wake_override;
        match ctx.store.get_flag(flag) {
            Ok(true) => {
                if let Err(e) = ctx.store.set_flag(flag, false) {
                    warn!(error = %e, "Failed to clear wake override flag");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "Wake override flag unreadable, continuing sleep");
                false
            }
        }
    }
}
