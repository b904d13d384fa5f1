use thiserror::Error;

use crate::command::Opcode;

/// Errors raised while parsing a frame off the wire.
///
/// None of these are fatal to a session: the inbound processor drops the
/// bytes, logs, and counts the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the frame layout requires; more may still arrive.
    #[error("truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// The ciphertext length disagrees with what the opcode declares.
    #[error("length mismatch for opcode {opcode}: declared {declared} bytes, got {actual}")]
    LengthMismatch {
        opcode: Opcode,
        declared: usize,
        actual: usize,
    },

    #[error("frame too long: {0} bytes")]
    TooLong(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// Sequence numbers are 24 bits on the wire.
    #[error("sequence {0:#x} does not fit in 24 bits")]
    SequenceOutOfRange(u32),

    /// The decrypted body does not match the command shape for its opcode.
    #[error("invalid {opcode} payload: {reason}")]
    InvalidPayload { opcode: Opcode, reason: String },
}

/// Errors reported by a [`crate::transport::Transport`] or
/// [`crate::transport::Link`]. Transports only move bytes, so these carry no
/// protocol meaning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("link closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid mesh identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error for everything the Command API can return.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Transport unreachable after the connect retry budget.
    #[error("connection error: {0}")]
    Connection(TransportError),

    /// Wrong credentials or a tampered packet.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Write failure after the write retry budget.
    #[error("I/O error: {0}")]
    Io(TransportError),

    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("device rejected command (status {0:#04x})")]
    Rejected(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MeshError {
    /// Whether this failure counts toward invalidating an authenticated
    /// session.
    pub fn counts_as_session_failure(&self) -> bool {
        matches!(
            self,
            MeshError::Authentication(_) | MeshError::MalformedFrame(_) | MeshError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
