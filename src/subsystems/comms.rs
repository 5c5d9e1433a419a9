use super::{Clock, FaultType, SimClock};
use crate::protocol::MAX_ENCODED_FRAME;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

/// Raw bytes exchanged with the transceiver: one encoded frame plus delimiter.
pub type RadioPacket = heapless::Vec<u8, MAX_ENCODED_FRAME>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    LoRa,
    Fsk,
}

impl Default for Modulation {
    fn default() -> Self {
        Modulation::LoRa
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("transceiver is offline")]
    Offline,
    #[error("transmission failed")]
    TransmitFailed,
    #[error("packet of {0} bytes exceeds the transceiver MTU")]
    PacketTooLarge(usize),
    #[error("modulation change rejected")]
    ModulationRejected,
    #[error("link I/O error: {0:?}")]
    Io(io::ErrorKind),
}

/// Half-duplex packet radio.
pub trait Transceiver {
    fn transmit(&mut self, packet: &[u8]) -> Result<(), RadioError>;

    /// Wait at most `timeout` for one packet.
    fn poll_receive(&mut self, timeout: Duration) -> Result<Option<RadioPacket>, RadioError>;

    fn set_modulation(&mut self, modulation: Modulation) -> Result<(), RadioError>;

    fn modulation(&self) -> Modulation;
}

#[derive(Debug, Default)]
struct SimRadioState {
    rx_queue: VecDeque<RadioPacket>,
    tx_history: Vec<(Duration, Vec<u8>)>,
    modulation: Modulation,
    fault_state: Option<FaultType>,
    failed_transmits: u32,
    fail_next_transmits: u32,
}

/// In-memory transceiver. Polling with an empty queue advances the simulated
/// clock by the full timeout.
///
/// Clones share the same air: a test keeps one handle to queue uplinks and
/// inspect downlinks while the flight core owns the other.
#[derive(Debug, Clone)]
pub struct SimRadio {
    state: Rc<RefCell<SimRadioState>>,
    clock: SimClock,
}

impl SimRadio {
    pub fn new(clock: SimClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimRadioState::default())),
            clock,
        }
    }

    pub fn queue_rx(&self, bytes: &[u8]) {
        let mut packet = RadioPacket::new();
        let take = bytes.len().min(MAX_ENCODED_FRAME);
        let _ = packet.extend_from_slice(&bytes[..take]);
        self.state.borrow_mut().rx_queue.push_back(packet);
    }

    pub fn pending_rx(&self) -> usize {
        self.state.borrow().rx_queue.len()
    }

    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .tx_history
            .iter()
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Clock readings at which each packet left the radio.
    pub fn transmit_times(&self) -> Vec<Duration> {
        self.state.borrow().tx_history.iter().map(|(at, _)| *at).collect()
    }

    pub fn failed_transmits(&self) -> u32 {
        self.state.borrow().failed_transmits
    }

    pub fn fail_next_transmits(&self, count: u32) {
        self.state.borrow_mut().fail_next_transmits = count;
    }

    pub fn inject_fault(&self, fault: FaultType) {
        self.state.borrow_mut().fault_state = Some(fault);
    }

    pub fn clear_faults(&self) {
        self.state.borrow_mut().fault_state = None;
    }
}

impl Transceiver for SimRadio {
    fn transmit(&mut self, packet: &[u8]) -> Result<(), RadioError> {
        let mut state = self.state.borrow_mut();
        match state.fault_state {
            Some(FaultType::Offline) => return Err(RadioError::Offline),
            Some(FaultType::Failed) => {
                state.failed_transmits += 1;
                return Err(RadioError::TransmitFailed);
            }
            Some(FaultType::Degraded) | None => {}
        }
        if state.fail_next_transmits > 0 {
            state.fail_next_transmits -= 1;
            state.failed_transmits += 1;
            return Err(RadioError::TransmitFailed);
        }
        if packet.len() > MAX_ENCODED_FRAME {
            return Err(RadioError::PacketTooLarge(packet.len()));
        }
        state.tx_history.push((self.clock.now(), packet.to_vec()));
        Ok(())
    }

    fn poll_receive(&mut self, timeout: Duration) -> Result<Option<RadioPacket>, RadioError> {
        {
            let mut state = self.state.borrow_mut();
            if state.fault_state == Some(FaultType::Offline) {
                return Err(RadioError::Offline);
            }
            if let Some(packet) = state.rx_queue.pop_front() {
                return Ok(Some(packet));
            }
        }
        self.clock.advance(timeout);
        Ok(None)
    }

    fn set_modulation(&mut self, modulation: Modulation) -> Result<(), RadioError> {
        let mut state = self.state.borrow_mut();
        if state.fault_state.is_some() {
            return Err(RadioError::ModulationRejected);
        }
        state.modulation = modulation;
        Ok(())
    }

    fn modulation(&self) -> Modulation {
        self.state.borrow().modulation
    }
}

/// Datagram link standing in for the RF path between the flight simulator and
/// the ground station binary. One datagram carries one encoded frame.
#[derive(Debug)]
pub struct UdpTransceiver {
    socket: UdpSocket,
    peer: SocketAddr,
    modulation: Modulation,
}

impl UdpTransceiver {
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        Ok(Self {
            socket,
            peer,
            modulation: Modulation::default(),
        })
    }
}

impl Transceiver for UdpTransceiver {
    fn transmit(&mut self, packet: &[u8]) -> Result<(), RadioError> {
        if packet.len() > MAX_ENCODED_FRAME {
            return Err(RadioError::PacketTooLarge(packet.len()));
        }
        self.socket
            .send_to(packet, self.peer)
            .map(|_| ())
            .map_err(|e| RadioError::Io(e.kind()))
    }

    fn poll_receive(&mut self, timeout: Duration) -> Result<Option<RadioPacket>, RadioError> {
        // A zero read timeout means "block forever" to the socket layer.
        if timeout.is_zero() {
            return Ok(None);
        }
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| RadioError::Io(e.kind()))?;

        let mut buf = [0u8; MAX_ENCODED_FRAME];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                let mut packet = RadioPacket::new();
                let _ = packet.extend_from_slice(&buf[..len]);
                Ok(Some(packet))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(RadioError::Io(e.kind())),
        }
    }

    fn set_modulation(&mut self, modulation: Modulation) -> Result<(), RadioError> {
        self.modulation = modulation;
        Ok(())
    }

    fn modulation(&self) -> Modulation {
        self.modulation
    }
}
