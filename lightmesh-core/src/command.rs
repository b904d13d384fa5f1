//! Opcode table and typed command payloads.
//!
//! The opcode set is open-ended. Every opcode the client understands has one
//! row in [`OPCODES`] and one [`Command`] variant; the codec and the crypto
//! engine only ever see an [`Opcode`] and opaque bytes, so adding a command
//! never touches them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;

/// Single-byte opcode carried in the clear frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const LOGIN: Opcode = Opcode(0x0c);
    pub const LOGIN_ACK: Opcode = Opcode(0x0d);
    pub const POWER: Opcode = Opcode(0xd0);
    pub const BRIGHTNESS: Opcode = Opcode(0xd2);
    pub const QUERY_STATUS: Opcode = Opcode(0xda);
    pub const STATUS: Opcode = Opcode(0xdb);
    pub const ACK: Opcode = Opcode(0xdc);
    pub const COLOR: Opcode = Opcode(0xe2);

    /// Table entry for this opcode, if the client knows it
    pub fn info(self) -> Option<&'static OpcodeInfo> {
        OPCODES.iter().find(|info| info.opcode == self)
    }

    /// Declared parameter length, excluding the leading opcode byte
    pub fn param_len(self) -> Option<usize> {
        self.info().map(|info| info.param_len)
    }

    pub fn name(self) -> &'static str {
        self.info().map(|info| info.name).unwrap_or("unknown")
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One row of the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub name: &'static str,
    pub param_len: usize,
}

/// Every opcode the client can send or receive.
pub const OPCODES: &[OpcodeInfo] = &[
    OpcodeInfo { opcode: Opcode::LOGIN, name: "login", param_len: NONCE_LEN },
    OpcodeInfo { opcode: Opcode::LOGIN_ACK, name: "login-ack", param_len: NONCE_LEN },
    OpcodeInfo { opcode: Opcode::POWER, name: "power", param_len: 1 },
    OpcodeInfo { opcode: Opcode::BRIGHTNESS, name: "brightness", param_len: 1 },
    OpcodeInfo { opcode: Opcode::QUERY_STATUS, name: "query-status", param_len: 0 },
    OpcodeInfo { opcode: Opcode::STATUS, name: "status", param_len: 5 },
    OpcodeInfo { opcode: Opcode::ACK, name: "ack", param_len: 4 },
    OpcodeInfo { opcode: Opcode::COLOR, name: "color", param_len: 3 },
];

/// Length of the handshake nonces exchanged in login frames
pub const NONCE_LEN: usize = 8;

/// Brightness is expressed in percent
pub const MAX_BRIGHTNESS: u8 = 100;

/// Ack status byte for an accepted command
pub const ACK_OK: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", hex::encode([self.r, self.g, self.b]))
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parses `#rrggbb` or `rrggbb`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        let bytes = hex::decode(digits).map_err(|e| format!("invalid color '{s}': {e}"))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(Self::new(*r, *g, *b)),
            _ => Err(format!("invalid color '{s}': expected 6 hex digits")),
        }
    }
}

/// Light state as reported by a fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LightStatus {
    pub on: bool,
    pub brightness: u8,
    pub color: Rgb,
}

/// A command with its typed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login { nonce: [u8; NONCE_LEN] },
    LoginAck { nonce: [u8; NONCE_LEN] },
    Power(bool),
    Brightness(u8),
    Color(Rgb),
    QueryStatus,
    Status(LightStatus),
    Ack { sequence: u32, status: u8 },
}

impl Command {
    /// Brightness command, rejecting levels above 100%
    pub fn brightness(level: u8) -> Result<Self, String> {
        if level > MAX_BRIGHTNESS {
            return Err(format!("brightness must be 0-{MAX_BRIGHTNESS}, got {level}"));
        }
        Ok(Command::Brightness(level))
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Login { .. } => Opcode::LOGIN,
            Command::LoginAck { .. } => Opcode::LOGIN_ACK,
            Command::Power(_) => Opcode::POWER,
            Command::Brightness(_) => Opcode::BRIGHTNESS,
            Command::Color(_) => Opcode::COLOR,
            Command::QueryStatus => Opcode::QUERY_STATUS,
            Command::Status(_) => Opcode::STATUS,
            Command::Ack { .. } => Opcode::ACK,
        }
    }

    /// Whether the device answers this command with an [`Command::Ack`]
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Command::Power(_) | Command::Brightness(_) | Command::Color(_) | Command::QueryStatus
        )
    }

    fn params(&self) -> Vec<u8> {
        match self {
            Command::Login { nonce } | Command::LoginAck { nonce } => nonce.to_vec(),
            Command::Power(on) => vec![u8::from(*on)],
            Command::Brightness(level) => vec![*level],
            Command::Color(rgb) => vec![rgb.r, rgb.g, rgb.b],
            Command::QueryStatus => Vec::new(),
            Command::Status(status) => vec![
                u8::from(status.on),
                status.brightness,
                status.color.r,
                status.color.g,
                status.color.b,
            ],
            Command::Ack { sequence, status } => {
                let seq = sequence.to_le_bytes();
                vec![seq[0], seq[1], seq[2], *status]
            }
        }
    }

    /// Plaintext body that gets encrypted: opcode byte followed by params
    pub fn to_body(&self) -> Vec<u8> {
        let params = self.params();
        let mut body = Vec::with_capacity(1 + params.len());
        body.push(self.opcode().0);
        body.extend_from_slice(&params);
        body
    }

    /// Parse a decrypted body. The first byte must repeat the header opcode.
    pub fn from_body(opcode: Opcode, body: &[u8]) -> Result<Self, FrameError> {
        let invalid = |reason: &str| FrameError::InvalidPayload {
            opcode,
            reason: reason.to_string(),
        };

        let (&inner, params) = body.split_first().ok_or_else(|| invalid("empty body"))?;
        if inner != opcode.0 {
            return Err(invalid("body opcode does not match header"));
        }

        let declared = opcode.param_len().ok_or(FrameError::UnknownOpcode(opcode))?;
        if params.len() != declared {
            return Err(FrameError::LengthMismatch {
                opcode,
                declared,
                actual: params.len(),
            });
        }

        let command = match opcode {
            Opcode::LOGIN => Command::Login { nonce: nonce_from(params) },
            Opcode::LOGIN_ACK => Command::LoginAck { nonce: nonce_from(params) },
            Opcode::POWER => match params[0] {
                0 => Command::Power(false),
                1 => Command::Power(true),
                _ => return Err(invalid("power flag must be 0 or 1")),
            },
            Opcode::BRIGHTNESS => {
                Command::brightness(params[0]).map_err(|reason| invalid(&reason))?
            }
            Opcode::COLOR => Command::Color(Rgb::new(params[0], params[1], params[2])),
            Opcode::QUERY_STATUS => Command::QueryStatus,
            Opcode::STATUS => {
                if params[1] > MAX_BRIGHTNESS {
                    return Err(invalid("brightness out of range"));
                }
                Command::Status(LightStatus {
                    on: params[0] != 0,
                    brightness: params[1],
                    color: Rgb::new(params[2], params[3], params[4]),
                })
            }
            Opcode::ACK => Command::Ack {
                sequence: u32::from_le_bytes([params[0], params[1], params[2], 0]),
                status: params[3],
            },
            other => return Err(FrameError::UnknownOpcode(other)),
        };

        Ok(command)
    }
}

fn nonce_from(params: &[u8]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&params[..NONCE_LEN]);
    nonce
}
