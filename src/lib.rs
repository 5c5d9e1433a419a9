//! # Satellite Flight Core
//!
//! Flight software core for a small battery-powered satellite: a single
//! supervisory loop that samples the power system, picks a power mode and
//! runs that mode's task list while keeping a hardware watchdog satisfied.
//!
//! ## Features
//!
//! - **Power-mode scheduling**: a data-driven table maps battery state to beacons, listening and sleep
//! - **Watchdog-safe sleep**: long sleeps are cut into spans with a pet between each
//! - **Radio framing**: COBS framing with CRC-16, a per-send rate limit and periodic station identification
//! - **Authenticated commands**: shared-secret uplink commands executed in arrival order
//! - **Durable counters**: boot, error and message counters that survive resets
//! - **Fault containment**: one top-level handler counts the fault, cools down and forces a reset
//!
//! ## Quick Start
//!
//! ```rust
//! use satcore::subsystems::sim::{sim_board, SimResetLine};
//! use satcore::subsystems::{PowerTelemetry, ScriptedPower};
//! use satcore::storage::MemoryStorage;
//! use satcore::{FlightConfig, PowerSupervisor};
//!
//! let mut config = FlightConfig::default();
//! config.sleep.reboot_after_s = Some(60);
//!
//! let power = ScriptedPower::steady(PowerTelemetry::new(4.1, 200.0));
//! let (board, _handles) = sim_board(MemoryStorage::new(), power);
//!
//! let mut supervisor = PowerSupervisor::boot(config, board).unwrap();
//! let reason = supervisor.run(&mut SimResetLine::new());
//! println!("reset: {}", reason);
//! ```
//!
//! ## Architecture
//!
//! - [`supervisor`] - Boot sequence, main loop and top-level fault handling
//! - [`power_mode`] - Power classification and the per-mode task table
//! - [`scheduler`] - Watchdog-safe sleep with wake override
//! - [`channel`] - Rate-limited, self-identifying packet transmission
//! - [`dispatcher`] - Listen windows and command execution
//! - [`protocol`] - Frame codec and command wire format
//! - [`telemetry`] - Beacons, health reports and jokes
//! - [`storage`] - Durable counters and flags
//! - [`subsystems`] - Hardware seams and simulated hardware

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod fault;
pub mod power_mode;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod subsystems;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;

// Re-export main public types for convenience
pub use config::FlightConfig;
pub use context::FlightContext;
pub use fault::ResetReason;
pub use power_mode::PowerMode;
pub use protocol::{Command, Frame, FrameKind};
pub use supervisor::{fly, PowerSupervisor, Termination};
