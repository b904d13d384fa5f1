//! Key derivation and authenticated encryption.
//!
//! Frames are sealed with AES-128-CCM, 4-byte tag, 13-byte nonce. The nonce
//! is derived from the frame sequence number alone, so callers must never
//! seal two frames with the same key and sequence. The session layer
//! guarantees this by splitting keys per direction and re-keying before the
//! 24-bit sequence space wraps.

use aes::Aes128;
use ccm::Ccm;
use ccm::aead::consts::{U4, U13};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::command::NONCE_LEN as HANDSHAKE_NONCE_LEN;
use crate::error::{MeshError, Result};

type FrameCipher = Ccm<Aes128, U4, U13>;

pub const KEY_LEN: usize = 16;
pub const TAG_LEN: usize = 4;
pub const NONCE_LEN: usize = 13;

/// CCM with a 2-byte length field
const MAX_PLAINTEXT_LEN: usize = 0xffff;

const MESH_KEY_LABEL: &[u8] = b"lightmesh/mesh-key/v1";
const LOGIN_C2D_LABEL: &[u8] = b"lightmesh/login/c2d";
const LOGIN_D2C_LABEL: &[u8] = b"lightmesh/login/d2c";
const LINK_C2D_LABEL: &[u8] = b"lightmesh/link/c2d";
const LINK_D2C_LABEL: &[u8] = b"lightmesh/link/d2c";

/// 128-bit symmetric key. Zeroized on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Direction-split keys. The client seals with `client_to_device` and opens
/// with `device_to_client`; a fixture does the reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkKeys {
    pub client_to_device: SessionKey,
    pub device_to_client: SessionKey,
}

/// Ciphertext with its detached tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn derive(&self, label: &[u8], parts: &[&[u8]]) -> SessionKey {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(self.0);
        for part in parts {
            hasher.update(part);
        }
        truncate(hasher.finalize().as_slice())
    }

    /// Seals the sequence-0 login request
    pub fn login_key(&self) -> SessionKey {
        self.derive(LOGIN_C2D_LABEL, &[])
    }

    /// Seals the fixture's answer to one login. Bound to that login's client
    /// nonce, so an answer captured from an earlier login does not open.
    pub fn login_reply_key(&self, client_nonce: &[u8; HANDSHAKE_NONCE_LEN]) -> SessionKey {
        let parts: [&[u8]; 1] = [client_nonce];
        self.derive(LOGIN_D2C_LABEL, &parts)
    }

    /// Keys for one authenticated session, bound to both login nonces
    pub fn link_keys(
        &self,
        client_nonce: &[u8; HANDSHAKE_NONCE_LEN],
        device_nonce: &[u8; HANDSHAKE_NONCE_LEN],
    ) -> LinkKeys {
        let parts: [&[u8]; 2] = [client_nonce, device_nonce];
        LinkKeys {
            client_to_device: self.derive(LINK_C2D_LABEL, &parts),
            device_to_client: self.derive(LINK_D2C_LABEL, &parts),
        }
    }
}

fn truncate(digest: &[u8]) -> SessionKey {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    SessionKey(key)
}

/// Derive the mesh key from a name/password pair. Pure and deterministic.
pub fn derive_session_key(mesh_name: &str, mesh_password: &str) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(MESH_KEY_LABEL);
    for secret in [mesh_name.as_bytes(), mesh_password.as_bytes()] {
        hasher.update((secret.len() as u32).to_le_bytes());
        hasher.update(secret);
    }
    truncate(hasher.finalize().as_slice())
}

/// Nonce for a sequence number: 3 little-endian bytes, zero padded
pub fn nonce_for(sequence: u32) -> [u8; NONCE_LEN] {
    let seq = sequence.to_le_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..3].copy_from_slice(&seq[..3]);
    nonce
}

pub fn encrypt(key: &SessionKey, sequence: u32, plaintext: &[u8]) -> Result<Sealed> {
    encrypt_with_aad(key, sequence, &[], plaintext)
}

/// Encrypt, additionally authenticating `aad` (not encrypted)
pub fn encrypt_with_aad(
    key: &SessionKey,
    sequence: u32,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(MeshError::InvalidArgument(format!(
            "plaintext of {len} bytes exceeds {MAX_PLAINTEXT_LEN}",
            len = plaintext.len()
        )));
    }

    let cipher = FrameCipher::new(GenericArray::from_slice(&key.0));
    let nonce = nonce_for(sequence);
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut buffer)
        .map_err(|_| MeshError::InvalidArgument("encryption failed".to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

pub fn decrypt(
    key: &SessionKey,
    sequence: u32,
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    decrypt_with_aad(key, sequence, &[], ciphertext, tag)
}

/// Decrypt and verify. On any mismatch nothing of the plaintext escapes.
pub fn decrypt_with_aad(
    key: &SessionKey,
    sequence: u32,
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let cipher = FrameCipher::new(GenericArray::from_slice(&key.0));
    let nonce = nonce_for(sequence);
    let mut buffer = ciphertext.to_vec();

    let verified = cipher.decrypt_in_place_detached(
        GenericArray::from_slice(&nonce),
        aad,
        &mut buffer,
        GenericArray::from_slice(tag),
    );

    if verified.is_err() {
        buffer.zeroize();
        return Err(MeshError::Authentication(format!(
            "tag mismatch on sequence {sequence}"
        )));
    }

    Ok(buffer)
}
