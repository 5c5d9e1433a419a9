use crate::channel::TransmitError;
use crate::config::{ConfigError, FlightConfig};
use crate::context::FlightContext;
use crate::fault::FaultClass;
use crate::protocol::{
    Authenticator, Command, CommandError, Frame, FrameKind, Response, ResponseStatus, MAX_RESPONSE_DETAIL,
};
use crate::storage::StorageError;
use crate::subsystems::{Clock, Modulation, Platform};
use crate::telemetry::{HealthReport, JokeBook};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that escape a loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("persistent storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl LoopError {
    /// Split a transmit error into fatal (escapes) and transient (logged).
    pub fn escalate(error: TransmitError) -> Result<TransmitError, LoopError> {
        match error {
            TransmitError::Storage(e) => Err(LoopError::Storage(e)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatcherState {
    Idle,
    Listening,
    Processing,
    Responding,
}

/// Which commands may run in the current power mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPolicy {
    Full,
    /// Power state unknown: refuse commands that reconfigure the radio or
    /// transmit beyond a single response.
    Restricted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenReport {
    pub received: u32,
    pub executed: u32,
    /// Frames ignored: wrong kind or failed authentication.
    pub dropped: u32,
    /// Authenticated frames answered with an error status.
    pub rejected: u32,
    pub reset_requested: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub windows: u32,
    pub commands_executed: u32,
    pub commands_rejected: u32,
    pub frames_dropped: u32,
    pub responses_failed: u32,
}

/// Work to do after the response has gone out.
enum FollowUp {
    None,
    Reset,
    SwitchModulation(Modulation),
    TellJoke,
}

/// Receives uplinked commands during a bounded window and executes them in
/// arrival order.
#[derive(Debug)]
pub struct CommandDispatcher {
    auth: Authenticator,
    max_window: Duration,
    state: DispatcherState,
    jokes: JokeBook,
    stats: DispatchStats,
}

impl CommandDispatcher {
    pub fn new(config: &FlightConfig) -> Result<Self, ConfigError> {
        let auth = Authenticator::new(config.radio.secret.as_bytes())
            .map_err(|e| ConfigError::invalid("radio.secret", e.to_string()))?;
        Ok(Self {
            auth,
            max_window: config.radio.max_listen_window(),
            state: DispatcherState::Idle,
            jokes: JokeBook::new(config.radio.jokes.clone()),
            stats: DispatchStats::default(),
        })
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Listen for up to `window`, clamped to the configured maximum. The
    /// window closes early after a reset command.
    pub fn listen<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        window: Duration,
        policy: ListenPolicy,
    ) -> Result<ListenReport, LoopError> {
        let window = window.min(self.max_window);
        self.stats.windows += 1;
        self.state = DispatcherState::Listening;
        debug!(window_s = window.as_secs(), ?policy, "Listening");

        let result = self.run_window(ctx, window, policy);
        self.state = DispatcherState::Idle;
        result
    }

    /// Send the next configured joke. Transient failures are logged.
    pub fn tell_joke<P: Platform>(&mut self, ctx: &mut FlightContext<P>) -> Result<(), LoopError> {
        match self.jokes.tell(ctx) {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = LoopError::escalate(e)?;
                warn!(error = %e, "Joke not sent");
                ctx.record_fault(FaultClass::TransientIo, &e);
                Ok(())
            }
        }
    }

    fn run_window<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        window: Duration,
        policy: ListenPolicy,
    ) -> Result<ListenReport, LoopError> {
        let deadline = ctx.clock.now() + window;
        let mut report = ListenReport::default();
        ctx.watchdog.pet();

        loop {
            let now = ctx.clock.now();
            if now >= deadline {
                break;
            }
            let poll = (deadline - now).min(ctx.watchdog.pet_interval());
            let received = ctx.channel.receive(poll);
            ctx.watchdog.pet();

            match received {
                Ok(Some(frame)) => {
                    report.received += 1;
                    self.state = DispatcherState::Processing;
                    self.process(ctx, &frame, policy, &mut report)?;
                    ctx.watchdog.pet();
                    if report.reset_requested {
                        info!("Reset requested, closing listen window");
                        break;
                    }
                    self.state = DispatcherState::Listening;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Receive failed, closing listen window");
                    ctx.record_fault(FaultClass::TransientIo, &e);
                    break;
                }
            }
        }

        Ok(report)
    }

    fn process<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        frame: &Frame,
        policy: ListenPolicy,
        report: &mut ListenReport,
    ) -> Result<(), LoopError> {
        if frame.kind != FrameKind::Command {
            debug!(kind = ?frame.kind, "Ignoring non-command frame");
            report.dropped += 1;
            self.stats.frames_dropped += 1;
            return Ok(());
        }

        let (opcode, args) = match self.auth.verify(frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, sequence = frame.sequence, "Dropping command frame");
                ctx.record_fault(FaultClass::Validation, &e);
                report.dropped += 1;
                self.stats.frames_dropped += 1;
                return Ok(());
            }
        };

        let command = match Command::parse(opcode, args) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejecting command");
                let status = match e {
                    CommandError::UnknownOpcode(_) => ResponseStatus::UnknownOpcode,
                    CommandError::BadArguments(_) => ResponseStatus::BadArguments,
                };
                report.rejected += 1;
                self.stats.commands_rejected += 1;
                return self.respond(ctx, Response::status_only(opcode, status));
            }
        };

        if policy == ListenPolicy::Restricted
            && matches!(command, Command::ChangeModulation(_) | Command::SendJoke)
        {
            info!(?command, "Command refused while power state is unknown");
            report.rejected += 1;
            self.stats.commands_rejected += 1;
            return self.respond(ctx, Response::status_only(opcode, ResponseStatus::Refused));
        }

        info!(?command, "Executing command");
        let (response, follow_up) = self.execute(ctx, command)?;
        report.executed += 1;
        self.stats.commands_executed += 1;
        self.respond(ctx, response)?;

        match follow_up {
            FollowUp::None => {}
            FollowUp::Reset => report.reset_requested = true,
            FollowUp::SwitchModulation(modulation) => {
                if let Err(e) = ctx.channel.set_modulation(modulation, &mut ctx.store) {
                    let e = LoopError::escalate(e)?;
                    warn!(error = %e, "Modulation change failed");
                    ctx.record_fault(FaultClass::TransientIo, &e);
                }
            }
            FollowUp::TellJoke => self.tell_joke(ctx)?,
        }
        Ok(())
    }

    fn execute<P: Platform>(
        &mut self,
        ctx: &mut FlightContext<P>,
        command: Command,
    ) -> Result<(Response, FollowUp), LoopError> {
        let opcode = command.opcode() as u8;
        let ok = Response::status_only(opcode, ResponseStatus::Ok);

        let outcome = match command {
            Command::Ping => (ok, FollowUp::None),
            Command::Reset => (ok, FollowUp::Reset),
            Command::ChangeModulation(modulation) => (ok, FollowUp::SwitchModulation(modulation)),
            Command::SendJoke => (ok, FollowUp::TellJoke),
            Command::StateOfHealth => {
                let response = HealthReport::collect(ctx)
                    .to_json(MAX_RESPONSE_DETAIL)
                    .and_then(|json| Response::new(opcode, ResponseStatus::Ok, &json).map_err(TransmitError::from))
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "State of health does not fit a response");
                        Response::status_only(opcode, ResponseStatus::Failed)
                    });
                (response, FollowUp::None)
            }
            Command::SetWakeOverride(enabled) => {
                ctx.store.set_flag(ctx.layout.wake_override, enabled)?;
                (ok, FollowUp::None)
            }
            Command::ClearErrorCount => {
                ctx.store.set(ctx.layout.error_count, 0)?;
                (ok, FollowUp::None)
            }
        };
        Ok(outcome)
    }

    fn respond<P: Platform>(&mut self, ctx: &mut FlightContext<P>, response: Response) -> Result<(), LoopError> {
        self.state = DispatcherState::Responding;
        let payload = response.to_payload();
        if let Err(e) = ctx.channel.send(FrameKind::Response, &payload, &mut ctx.store) {
            let e = LoopError::escalate(e)?;
            warn!(error = %e, status = ?response.status, "Response not sent");
            ctx.record_fault(FaultClass::TransientIo, &e);
            self.stats.responses_failed += 1;
        }
        Ok(())
    }
}
