use arrayvec::ArrayString;
use core::fmt::{self, Write};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_FAULT_HISTORY: usize = 16;
pub const MAX_FAULT_MESSAGE: usize = 64;

pub type FaultMessage = ArrayString<MAX_FAULT_MESSAGE>;

/// Failure taxonomy used for logging, fault history and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    /// Collaborator I/O failed; the task is skipped and the loop continues.
    TransientIo,
    /// Inbound data failed framing, checksum or authentication.
    Validation,
    /// Configuration rejected at boot.
    Config,
    /// An error escaped a loop iteration and forces a reset.
    CriticalLoop,
}

/// Why the flight computer last went through reset.
///
/// The numeric code is what the `last_reset` slot stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetReason {
    /// No controlled reset was recorded and the watchdog line did not report
    /// expiry: power-on, brown-out or a watchdog without a reset-cause register.
    Uncontrolled,
    LoopFault,
    Scheduled,
    Commanded,
    BootFault,
    /// The watchdog line reported expiry at boot. Never written to storage.
    Watchdog,
}

impl ResetReason {
    pub fn code(self) -> u32 {
        match self {
            ResetReason::Uncontrolled => 0,
            ResetReason::LoopFault => 1,
            ResetReason::Scheduled => 2,
            ResetReason::Commanded => 3,
            ResetReason::BootFault => 4,
            ResetReason::Watchdog => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ResetReason::Uncontrolled),
            1 => Some(ResetReason::LoopFault),
            2 => Some(ResetReason::Scheduled),
            3 => Some(ResetReason::Commanded),
            4 => Some(ResetReason::BootFault),
            5 => Some(ResetReason::Watchdog),
            _ => None,
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub class: FaultClass,
    pub uptime_s: u64,
    pub message: FaultMessage,
}

/// Bounded history of recent faults. The oldest record is evicted when full.
#[derive(Debug)]
pub struct FaultLog {
    history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
    total: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_fault_id: 1,
            total: 0,
        }
    }

    pub fn record(&mut self, class: FaultClass, uptime: Duration, message: impl fmt::Display) -> u32 {
        let id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);
        self.total = self.total.saturating_add(1);

        let record = FaultRecord {
            id,
            class,
            uptime_s: uptime.as_secs(),
            message: truncated(message),
        };

        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(record);
        id
    }

    pub fn last(&self) -> Option<&FaultRecord> {
        self.history.last()
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }

    /// Faults recorded since boot, including evicted ones.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self, class: FaultClass) -> usize {
        self.history.iter().filter(|r| r.class == class).count()
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats into a fixed-capacity string, cutting at the last character that fits.
fn truncated(message: impl fmt::Display) -> FaultMessage {
    struct Bounded(FaultMessage);

    impl Write for Bounded {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for ch in s.chars() {
                if self.0.try_push(ch).is_err() {
                    return Err(fmt::Error);
                }
            }
            Ok(())
        }
    }

    let mut out = Bounded(FaultMessage::new());
    let _ = write!(out, "{}", message);
    out.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reason_codes_round_trip() {
        for reason in [
            ResetReason::Uncontrolled,
            ResetReason::LoopFault,
            ResetReason::Scheduled,
            ResetReason::Commanded,
            ResetReason::BootFault,
            ResetReason::Watchdog,
        ] {
            assert_eq!(ResetReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(ResetReason::from_code(99), None);
    }

    #[test]
    fn test_fault_log_evicts_oldest() {
        let mut log = FaultLog::new();
        for i in 0..(MAX_FAULT_HISTORY as u64 + 4) {
            log.record(FaultClass::TransientIo, Duration::from_secs(i), format_args!("fault {}", i));
        }

        assert_eq!(log.history().len(), MAX_FAULT_HISTORY);
        assert_eq!(log.total(), MAX_FAULT_HISTORY as u32 + 4);
        assert_eq!(log.history()[0].uptime_s, 4);
        assert_eq!(log.last().map(|r| r.message.as_str()), Some("fault 19"));
    }

    #[test]
    fn test_long_messages_are_truncated() {
        let mut log = FaultLog::new();
        let long = "x".repeat(200);
        log.record(FaultClass::Validation, Duration::ZERO, &long);

        let record = log.last().unwrap();
        assert_eq!(record.message.len(), MAX_FAULT_MESSAGE);
        assert_eq!(log.count(FaultClass::Validation), 1);
        assert_eq!(log.count(FaultClass::CriticalLoop), 0);
    }
}
