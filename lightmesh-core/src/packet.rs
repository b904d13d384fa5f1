//! Sealing commands into wire frames and opening them again.
//!
//! The clear header (address, opcode, sequence) is bound to the ciphertext
//! as associated data, so a frame cannot be re-addressed or relabelled
//! without failing authentication.

use crate::codec::{Frame, decode_frame, encode_frame, header_bytes};
use crate::command::Command;
use crate::crypto::{SessionKey, decrypt_with_aad, encrypt_with_aad};
use crate::error::Result;

/// Encrypt `command` under `key` at `sequence` and encode the frame
pub fn seal_command(
    key: &SessionKey,
    mesh_address: u16,
    sequence: u32,
    command: &Command,
) -> Result<Vec<u8>> {
    let opcode = command.opcode();
    let header = header_bytes(mesh_address, opcode, sequence);
    let sealed = encrypt_with_aad(key, sequence, &header, &command.to_body())?;

    let frame = Frame {
        mesh_address,
        opcode,
        sequence,
        ciphertext: sealed.ciphertext,
        tag: sealed.tag,
    };
    Ok(encode_frame(&frame)?)
}

/// Decrypt a decoded frame and parse its body
pub fn open_frame(key: &SessionKey, frame: &Frame) -> Result<Command> {
    let body = decrypt_with_aad(
        key,
        frame.sequence,
        &frame.header(),
        &frame.ciphertext,
        &frame.tag,
    )?;
    Ok(Command::from_body(frame.opcode, &body)?)
}

/// Decode and open in one step
pub fn open_command(key: &SessionKey, bytes: &[u8]) -> Result<(Frame, Command)> {
    let frame = decode_frame(bytes)?;
    let command = open_frame(key, &frame)?;
    Ok((frame, command))
}
