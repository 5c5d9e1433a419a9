use crate::config::{ConfigError, RadioConfig};
use crate::protocol::{Frame, FrameError, FrameKind, Payload, ValidationError};
use crate::storage::{Counter, DurableStorage, Flag, PersistentStore, StorageError, StoreLayout};
use crate::subsystems::{Clock, Modulation, RadioError, Transceiver};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmitError {
    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("radio failure: {0}")]
    Radio(#[from] RadioError),
    #[error("persistent counter update failed: {0}")]
    Storage(#[from] StorageError),
    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

impl TransmitError {
    /// Storage failures mean durable state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransmitError::Storage(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("radio failure: {0}")]
    Radio(#[from] RadioError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationIdPolicy {
    pub every_sends: Option<u32>,
    pub interval: Option<Duration>,
}

impl StationIdPolicy {
    pub fn from_config(config: &RadioConfig) -> Self {
        Self {
            every_sends: config.station_id_every_sends,
            interval: config.station_id_interval_s.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub payloads_sent: u32,
    pub station_ids_sent: u32,
    pub send_failures: u32,
    pub oversized_rejected: u32,
    pub frames_received: u32,
    pub frames_dropped: u32,
}

/// Framed, rate-limited and self-identifying access to the transceiver.
///
/// Consecutive transmissions are at least `min_send_delay` apart. The call
/// sign goes out as its own frame on the first transmission after boot, then
/// whenever either configured trigger fires.
#[derive(Debug)]
pub struct PacketChannel<R, C> {
    radio: R,
    clock: C,
    license: Payload,
    min_send_delay: Duration,
    policy: StationIdPolicy,
    message_counter: Counter,
    modulation_flag: Flag,
    sequence: u16,
    last_send: Option<Duration>,
    last_station_id: Option<Duration>,
    sends_since_id: u32,
    stats: ChannelStats,
}

impl<R: Transceiver, C: Clock> PacketChannel<R, C> {
    pub fn new(radio: R, clock: C, config: &RadioConfig, layout: &StoreLayout) -> Result<Self, ConfigError> {
        let license = Payload::from_slice(config.license.as_bytes())
            .map_err(|_| ConfigError::invalid("radio.license", "does not fit one frame"))?;
        Ok(Self {
            radio,
            clock,
            license,
            min_send_delay: config.min_send_delay(),
            policy: StationIdPolicy::from_config(config),
            message_counter: layout.message_count,
            modulation_flag: layout.radio_fsk,
            sequence: 0,
            last_send: None,
            last_station_id: None,
            sends_since_id: 0,
            stats: ChannelStats::default(),
        })
    }

    /// Transmit one payload frame. Returns its sequence number.
    ///
    /// The message counter advances only when the transceiver accepted the
    /// payload. A due station identification is sent either way.
    ///
    /// Blocks for at most one `min_send_delay` before the payload, plus one
    /// more when an identification follows it.
    pub fn send<S: DurableStorage>(
        &mut self,
        kind: FrameKind,
        payload: &[u8],
        store: &mut PersistentStore<S>,
    ) -> Result<u16, TransmitError> {
        let frame = match Frame::new(kind, self.sequence, payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.oversized_rejected += 1;
                warn!(?kind, error = %e, "Refusing to send frame");
                return Err(e.into());
            }
        };
        self.sequence = self.sequence.wrapping_add(1);

        let sent = self.transmit_frame(&frame);
        self.sends_since_id = self.sends_since_id.saturating_add(1);

        if self.station_id_due() {
            if let Err(e) = self.send_station_id() {
                warn!(error = %e, "Station identification failed");
            }
        }

        sent?;
        self.stats.payloads_sent += 1;
        let count = store.increment(self.message_counter)?;
        debug!(?kind, sequence = frame.sequence, bytes = payload.len(), message_count = count, "Frame sent");
        Ok(frame.sequence)
    }

    pub fn send_station_id(&mut self) -> Result<(), TransmitError> {
        let frame = Frame::new(FrameKind::StationId, self.sequence, &self.license)?;
        self.sequence = self.sequence.wrapping_add(1);
        self.transmit_frame(&frame)?;

        self.last_station_id = Some(self.clock.now());
        self.sends_since_id = 0;
        self.stats.station_ids_sent += 1;
        debug!("Station identification sent");
        Ok(())
    }

    /// Wait at most `timeout` for a valid frame. Undecodable frames are
    /// counted, logged and skipped.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, ReceiveError> {
        let deadline = self.clock.now() + timeout;
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return Ok(None);
            }
            let Some(packet) = self.radio.poll_receive(deadline - now)? else {
                return Ok(None);
            };
            self.stats.frames_received += 1;

            match Frame::decode(&packet) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    let error = ValidationError::Malformed(e);
                    warn!(%error, bytes = packet.len(), "Dropping frame");
                }
            }
        }
    }

    /// Reconfigure the transceiver and persist the choice.
    pub fn set_modulation<S: DurableStorage>(
        &mut self,
        modulation: Modulation,
        store: &mut PersistentStore<S>,
    ) -> Result<(), TransmitError> {
        self.radio.set_modulation(modulation)?;
        store.set_flag(self.modulation_flag, modulation == Modulation::Fsk)?;
        info!(?modulation, "Radio modulation changed");
        Ok(())
    }

    /// Apply the persisted modulation after a reset.
    pub fn restore_modulation<S: DurableStorage>(
        &mut self,
        store: &PersistentStore<S>,
    ) -> Result<Modulation, StorageError> {
        let modulation = if store.get_flag(self.modulation_flag)? {
            Modulation::Fsk
        } else {
            Modulation::LoRa
        };
        if let Err(e) = self.radio.set_modulation(modulation) {
            warn!(?modulation, error = %e, "Could not restore radio modulation");
        }
        Ok(self.radio.modulation())
    }

    pub fn modulation(&self) -> Modulation {
        self.radio.modulation()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn station_id_due(&self) -> bool {
        let Some(last) = self.last_station_id else {
            return true;
        };
        let by_count = self.policy.every_sends.map_or(false, |n| self.sends_since_id >= n);
        let by_time = self
            .policy
            .interval
            .map_or(false, |interval| self.clock.now().saturating_sub(last) >= interval);
        by_count || by_time
    }

    fn transmit_frame(&mut self, frame: &Frame) -> Result<(), TransmitError> {
        self.wait_for_send_slot();
        let encoded = frame.encode();
        let result = self.radio.transmit(&encoded);
        self.last_send = Some(self.clock.now());

        if let Err(e) = result {
            self.stats.send_failures += 1;
            warn!(kind = ?frame.kind, error = %e, "Transmission failed");
            return Err(e.into());
        }
        Ok(())
    }

    fn wait_for_send_slot(&self) {
        if let Some(last) = self.last_send {
            let elapsed = self.clock.now().saturating_sub(last);
            if elapsed < self.min_send_delay {
                self.clock.sleep(self.min_send_delay - elapsed);
            }
        }
    }
}
