//! Frame layout on the wire.
//!
//! ```text
//! [mesh_address: 2][opcode: 1][sequence: 3][ciphertext: N][tag: 4]
//! ```
//!
//! All integers are little-endian. `N` is fixed per opcode (see
//! [`crate::command::OPCODES`]): the encrypted body is the opcode byte
//! followed by its parameters.

use crate::command::Opcode;
use crate::crypto::TAG_LEN;
use crate::error::FrameError;

/// Bytes before the ciphertext: address, opcode, sequence
pub const HEADER_LEN: usize = 6;

/// Smallest possible frame: header, one body byte, tag
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1 + TAG_LEN;

/// BLE 4.x default ATT payload
pub const MAX_FRAME_LEN: usize = 20;

/// Largest value a 3-byte sequence field can hold
pub const MAX_SEQUENCE: u32 = 0x00ff_ffff;

/// Address of the node the link is connected to
pub const LOCAL_ADDRESS: u16 = 0x0000;

/// Mesh-wide broadcast address
pub const BROADCAST_ADDRESS: u16 = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub mesh_address: u16,
    pub opcode: Opcode,
    pub sequence: u32,
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Frame {
    /// The clear-text header, authenticated as associated data
    pub fn header(&self) -> [u8; HEADER_LEN] {
        header_bytes(self.mesh_address, self.opcode, self.sequence)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.ciphertext.len() + TAG_LEN
    }
}

/// Header bytes for a frame that has not been sealed yet
pub fn header_bytes(mesh_address: u16, opcode: Opcode, sequence: u32) -> [u8; HEADER_LEN] {
    let addr = mesh_address.to_le_bytes();
    let seq = sequence.to_le_bytes();
    [addr[0], addr[1], opcode.0, seq[0], seq[1], seq[2]]
}

/// Serialize a frame. Fails only if the frame could never be decoded again.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    if frame.sequence > MAX_SEQUENCE {
        return Err(FrameError::SequenceOutOfRange(frame.sequence));
    }

    let len = frame.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(len));
    }

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&frame.header());
    buf.extend_from_slice(&frame.ciphertext);
    buf.extend_from_slice(&frame.tag);
    Ok(buf)
}

/// Parse a frame. Never panics; every bound violation is a [`FrameError`].
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated {
            needed: MIN_FRAME_LEN,
            actual: data.len(),
        });
    }
    if data.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong(data.len()));
    }

    let mesh_address = u16::from_le_bytes([data[0], data[1]]);
    let opcode = Opcode(data[2]);
    let sequence = u32::from_le_bytes([data[3], data[4], data[5], 0]);

    let param_len = opcode.param_len().ok_or(FrameError::UnknownOpcode(opcode))?;
    let declared = 1 + param_len;
    let actual = data.len() - HEADER_LEN - TAG_LEN;

    if actual < declared {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN + declared + TAG_LEN,
            actual: data.len(),
        });
    }
    if actual != declared {
        return Err(FrameError::LengthMismatch {
            opcode,
            declared,
            actual,
        });
    }

    let body_end = HEADER_LEN + declared;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&data[body_end..]);

    Ok(Frame {
        mesh_address,
        opcode,
        sequence,
        ciphertext: data[HEADER_LEN..body_end].to_vec(),
        tag,
    })
}
