//! Wire format.
//!
//! Frame on the air:
//! `COBS([version u8][kind u8][sequence u16 LE][length u16 LE][payload][crc16 LE]) 0x00`
//!
//! The CRC is CRC-16/XMODEM over everything before it. Command frames carry
//! `[secret][opcode][args]`; response frames carry `[opcode][status][detail]`.

use crc::{Crc, CRC_16_XMODEM};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

use crate::subsystems::Modulation;

pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_PAYLOAD: usize = 240;
pub const FRAME_HEADER_LEN: usize = 6;
pub const FRAME_CRC_LEN: usize = 2;
pub const MAX_RAW_FRAME: usize = FRAME_HEADER_LEN + MAX_PAYLOAD + FRAME_CRC_LEN;
/// Largest encoded frame including the trailing delimiter.
pub const MAX_ENCODED_FRAME: usize = 256;
pub const FRAME_DELIMITER: u8 = 0x00;
pub const MAX_SECRET_LEN: usize = 32;

// COBS adds one byte per 254 plus the leading code byte and the delimiter.
const_assert!(MAX_RAW_FRAME + MAX_RAW_FRAME / 254 + 2 <= MAX_ENCODED_FRAME);
const_assert!(MAX_PAYLOAD <= u16::MAX as usize);
const_assert!(MAX_SECRET_LEN + 2 < MAX_PAYLOAD);

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub type Payload = Vec<u8, MAX_PAYLOAD>;
pub type EncodedFrame = Vec<u8, MAX_ENCODED_FRAME>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("frame shorter than header and checksum")]
    Truncated,
    #[error("COBS decoding failed")]
    Cobs,
    #[error("checksum mismatch: frame says {expected:#06x}, computed {actual:#06x}")]
    Crc { expected: u16, actual: u16 },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("length field {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// State of health, IMU reports and other telemetry.
    Data = 0x01,
    StationId = 0x02,
    Beacon = 0x03,
    Command = 0x04,
    Response = 0x05,
    Joke = 0x06,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Data),
            0x02 => Some(FrameKind::StationId),
            0x03 => Some(FrameKind::Beacon),
            0x04 => Some(FrameKind::Command),
            0x05 => Some(FrameKind::Response),
            0x06 => Some(FrameKind::Joke),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence: u16,
    payload: Payload,
}

impl Frame {
    /// Fails rather than truncating when the payload does not fit.
    pub fn new(kind: FrameKind, sequence: u16, payload: &[u8]) -> Result<Self, FrameError> {
        let payload = Payload::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        })?;
        Ok(Self {
            kind,
            sequence,
            payload,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// COBS-encoded bytes including the trailing delimiter.
    pub fn encode(&self) -> EncodedFrame {
        let len = self.payload.len();
        let body_end = FRAME_HEADER_LEN + len;
        let raw_len = body_end + FRAME_CRC_LEN;

        let mut raw = [0u8; MAX_RAW_FRAME];
        raw[0] = PROTOCOL_VERSION;
        raw[1] = self.kind as u8;
        raw[2..4].copy_from_slice(&self.sequence.to_le_bytes());
        raw[4..6].copy_from_slice(&(len as u16).to_le_bytes());
        raw[FRAME_HEADER_LEN..body_end].copy_from_slice(&self.payload);
        let crc = CRC.checksum(&raw[..body_end]);
        raw[body_end..raw_len].copy_from_slice(&crc.to_le_bytes());

        let mut out = [0u8; MAX_ENCODED_FRAME];
        let written = corncobs::encode_buf(&raw[..raw_len], &mut out);

        let mut encoded = EncodedFrame::new();
        let _ = encoded.extend_from_slice(&out[..written]);
        encoded
    }

    /// Decode one frame. The trailing delimiter is optional.
    pub fn decode(encoded: &[u8]) -> Result<Self, FrameError> {
        let body = encoded.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(encoded);
        if body.is_empty() {
            return Err(FrameError::Truncated);
        }
        if body.len() >= MAX_ENCODED_FRAME {
            return Err(FrameError::PayloadTooLarge {
                len: body.len(),
                max: MAX_ENCODED_FRAME - 1,
            });
        }

        // corncobs expects the delimiter in its input.
        let mut input = [0u8; MAX_ENCODED_FRAME];
        input[..body.len()].copy_from_slice(body);
        input[body.len()] = FRAME_DELIMITER;

        let mut raw = [0u8; MAX_ENCODED_FRAME];
        let decoded = corncobs::decode_buf(&input[..=body.len()], &mut raw).map_err(|_| FrameError::Cobs)?;
        let raw = &raw[..decoded];

        if raw.len() < FRAME_HEADER_LEN + FRAME_CRC_LEN {
            return Err(FrameError::Truncated);
        }
        if raw[0] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(raw[0]));
        }

        let declared = usize::from(u16::from_le_bytes([raw[4], raw[5]]));
        let actual = raw.len() - FRAME_HEADER_LEN - FRAME_CRC_LEN;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let body_end = FRAME_HEADER_LEN + declared;
        let expected = u16::from_le_bytes([raw[body_end], raw[body_end + 1]]);
        let actual_crc = CRC.checksum(&raw[..body_end]);
        if expected != actual_crc {
            return Err(FrameError::Crc {
                expected,
                actual: actual_crc,
            });
        }

        let kind = FrameKind::from_byte(raw[1]).ok_or(FrameError::UnknownKind(raw[1]))?;
        let sequence = u16::from_le_bytes([raw[2], raw[3]]);
        Frame::new(kind, sequence, &raw[FRAME_HEADER_LEN..body_end])
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Ping = 0x01,
    Reset = 0x02,
    ChangeModulation = 0x03,
    SendJoke = 0x04,
    StateOfHealth = 0x05,
    SetWakeOverride = 0x06,
    ClearErrorCount = 0x07,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::Ping),
            0x02 => Some(Opcode::Reset),
            0x03 => Some(Opcode::ChangeModulation),
            0x04 => Some(Opcode::SendJoke),
            0x05 => Some(Opcode::StateOfHealth),
            0x06 => Some(Opcode::SetWakeOverride),
            0x07 => Some(Opcode::ClearErrorCount),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("malformed arguments for {0:?}")]
    BadArguments(Opcode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Ping,
    Reset,
    ChangeModulation(Modulation),
    SendJoke,
    StateOfHealth,
    SetWakeOverride(bool),
    ClearErrorCount,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Ping => Opcode::Ping,
            Command::Reset => Opcode::Reset,
            Command::ChangeModulation(_) => Opcode::ChangeModulation,
            Command::SendJoke => Opcode::SendJoke,
            Command::StateOfHealth => Opcode::StateOfHealth,
            Command::SetWakeOverride(_) => Opcode::SetWakeOverride,
            Command::ClearErrorCount => Opcode::ClearErrorCount,
        }
    }

    pub fn parse(opcode: u8, args: &[u8]) -> Result<Self, CommandError> {
        let op = Opcode::from_byte(opcode).ok_or(CommandError::UnknownOpcode(opcode))?;
        let bad = CommandError::BadArguments(op);
        let no_args = |command| if args.is_empty() { Ok(command) } else { Err(bad) };

        match op {
            Opcode::Ping => no_args(Command::Ping),
            Opcode::Reset => no_args(Command::Reset),
            Opcode::SendJoke => no_args(Command::SendJoke),
            Opcode::StateOfHealth => no_args(Command::StateOfHealth),
            Opcode::ClearErrorCount => no_args(Command::ClearErrorCount),
            Opcode::ChangeModulation => match args {
                [0] => Ok(Command::ChangeModulation(Modulation::LoRa)),
                [1] => Ok(Command::ChangeModulation(Modulation::Fsk)),
                _ => Err(bad),
            },
            Opcode::SetWakeOverride => match args {
                [0] => Ok(Command::SetWakeOverride(false)),
                [1] => Ok(Command::SetWakeOverride(true)),
                _ => Err(bad),
            },
        }
    }

    pub fn args(&self) -> Vec<u8, 1> {
        let mut args = Vec::new();
        match self {
            Command::ChangeModulation(Modulation::LoRa) => {
                let _ = args.push(0);
            }
            Command::ChangeModulation(Modulation::Fsk) => {
                let _ = args.push(1);
            }
            Command::SetWakeOverride(enabled) => {
                let _ = args.push(u8::from(*enabled));
            }
            _ => {}
        }
        args
    }

    /// Uplink payload: `[secret][opcode][args]`.
    pub fn to_uplink(&self, secret: &[u8]) -> Result<Payload, FrameError> {
        let args = self.args();
        let len = secret.len() + 1 + args.len();
        let too_large = FrameError::PayloadTooLarge { len, max: MAX_PAYLOAD };

        let mut payload = Payload::new();
        payload.extend_from_slice(secret).map_err(|_| too_large)?;
        payload.push(self.opcode() as u8).map_err(|_| too_large)?;
        payload.extend_from_slice(&args).map_err(|_| too_large)?;
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("frame kind {0:?} is not a command")]
    NotACommand(FrameKind),
    #[error("command payload of {len} bytes is shorter than the {min} byte minimum")]
    TooShort { len: usize, min: usize },
    #[error("shared secret mismatch")]
    BadSecret,
    #[error("undecodable frame: {0}")]
    Malformed(FrameError),
}

/// Checks the shared secret that prefixes every command.
#[derive(Debug, Clone)]
pub struct Authenticator {
    secret: Vec<u8, MAX_SECRET_LEN>,
}

impl Authenticator {
    pub fn new(secret: &[u8]) -> Result<Self, FrameError> {
        let secret = Vec::from_slice(secret).map_err(|_| FrameError::PayloadTooLarge {
            len: secret.len(),
            max: MAX_SECRET_LEN,
        })?;
        Ok(Self { secret })
    }

    /// Split an authenticated command payload into opcode byte and arguments.
    pub fn verify<'a>(&self, frame: &'a Frame) -> Result<(u8, &'a [u8]), ValidationError> {
        if frame.kind != FrameKind::Command {
            return Err(ValidationError::NotACommand(frame.kind));
        }
        let payload = frame.payload();
        let min = self.secret.len() + 1;
        if payload.len() < min {
            return Err(ValidationError::TooShort {
                len: payload.len(),
                min,
            });
        }

        let (secret, rest) = payload.split_at(self.secret.len());
        if !constant_time_eq(secret, &self.secret) {
            return Err(ValidationError::BadSecret);
        }
        Ok((rest[0], &rest[1..]))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok = 0x00,
    UnknownOpcode = 0x01,
    BadArguments = 0x02,
    Failed = 0x03,
    /// Not allowed while the power state is unknown.
    Refused = 0x04,
}

impl ResponseStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ResponseStatus::Ok),
            0x01 => Some(ResponseStatus::UnknownOpcode),
            0x02 => Some(ResponseStatus::BadArguments),
            0x03 => Some(ResponseStatus::Failed),
            0x04 => Some(ResponseStatus::Refused),
            _ => None,
        }
    }
}

pub const MAX_RESPONSE_DETAIL: usize = MAX_PAYLOAD - 2;

/// Response payload: `[opcode][status][detail]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: ResponseStatus,
    detail: Vec<u8, MAX_RESPONSE_DETAIL>,
}

impl Response {
    pub fn new(opcode: u8, status: ResponseStatus, detail: &[u8]) -> Result<Self, FrameError> {
        let detail = Vec::from_slice(detail).map_err(|_| FrameError::PayloadTooLarge {
            len: detail.len() + 2,
            max: MAX_PAYLOAD,
        })?;
        Ok(Self {
            opcode,
            status,
            detail,
        })
    }

    pub fn status_only(opcode: u8, status: ResponseStatus) -> Self {
        Self {
            opcode,
            status,
            detail: Vec::new(),
        }
    }

    pub fn detail(&self) -> &[u8] {
        &self.detail
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        let _ = payload.push(self.opcode);
        let _ = payload.push(self.status as u8);
        let _ = payload.extend_from_slice(&self.detail);
        payload
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [opcode, status, detail @ ..] => {
                let status = ResponseStatus::from_byte(*status)?;
                Self::new(*opcode, status, detail).ok()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_across_payload_sizes() {
        for len in [0, 1, 2, 17, 128, 253, 254, 255].into_iter().filter(|l| *l <= MAX_PAYLOAD).chain([MAX_PAYLOAD]) {
            // Include zeros so COBS has work to do.
            let payload: std::vec::Vec<u8> = (0..len).map(|i| (i % 7) as u8).collect();
            let frame = Frame::new(FrameKind::Data, len as u16, &payload).unwrap();
            let encoded = frame.encode();

            assert_eq!(encoded.last(), Some(&FRAME_DELIMITER));
            assert!(!encoded[..encoded.len() - 1].contains(&FRAME_DELIMITER));
            assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = [0xAAu8; MAX_PAYLOAD + 1];
        assert_eq!(
            Frame::new(FrameKind::Beacon, 0, &payload),
            Err(FrameError::PayloadTooLarge {
                len: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let frame = Frame::new(FrameKind::Beacon, 7, b"hello satellite").unwrap();
        let mut encoded = frame.encode();
        // Flip a payload byte without introducing a delimiter.
        let idx = 10;
        encoded[idx] = if encoded[idx] == 0x55 { 0x56 } else { 0x55 };

        assert!(Frame::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_without_delimiter() {
        let frame = Frame::new(FrameKind::StationId, 1, b"N0CALL").unwrap();
        let encoded = frame.encode();
        let body = &encoded[..encoded.len() - 1];
        assert_eq!(Frame::decode(body).unwrap(), frame);
    }

    #[test]
    fn test_command_parse_table() {
        assert_eq!(Command::parse(0x01, &[]), Ok(Command::Ping));
        assert_eq!(Command::parse(0x03, &[1]), Ok(Command::ChangeModulation(Modulation::Fsk)));
        assert_eq!(Command::parse(0x06, &[0]), Ok(Command::SetWakeOverride(false)));
        assert_eq!(Command::parse(0x03, &[2]), Err(CommandError::BadArguments(Opcode::ChangeModulation)));
        assert_eq!(Command::parse(0x01, &[9]), Err(CommandError::BadArguments(Opcode::Ping)));
        assert_eq!(Command::parse(0x42, &[]), Err(CommandError::UnknownOpcode(0x42)));
    }

    #[test]
    fn test_authenticator_rejects_wrong_secret() {
        let auth = Authenticator::new(b"s3cret").unwrap();

        let good = Frame::new(FrameKind::Command, 0, &Command::Ping.to_uplink(b"s3cret").unwrap()).unwrap();
        assert_eq!(auth.verify(&good), Ok((Opcode::Ping as u8, &[][..])));

        let bad = Frame::new(FrameKind::Command, 0, &Command::Ping.to_uplink(b"s3cred").unwrap()).unwrap();
        assert_eq!(auth.verify(&bad), Err(ValidationError::BadSecret));

        let short = Frame::new(FrameKind::Command, 0, b"s3c").unwrap();
        assert!(matches!(auth.verify(&short), Err(ValidationError::TooShort { .. })));

        let beacon = Frame::new(FrameKind::Beacon, 0, b"s3cret\x01").unwrap();
        assert_eq!(auth.verify(&beacon), Err(ValidationError::NotACommand(FrameKind::Beacon)));
    }

    #[test]
    fn test_response_layout() {
        let response = Response::new(Opcode::StateOfHealth as u8, ResponseStatus::Ok, b"{}").unwrap();
        let payload = response.to_payload();
        assert_eq!(payload.as_slice(), &[0x05, 0x00, b'{', b'}']);
        assert_eq!(Response::parse(&payload), Some(response));
        assert_eq!(Response::parse(&[0x05]), None);
    }
}
