// Chunk envelope: XChaCha20-Poly1305 with a detached tag
//
// Wire layout:
//   [u32 BE nonce length][nonce][16-byte tag][ciphertext]
//
// The nonce length prefix lets a receiver reject frames sealed with a
// different AEAD instead of misparsing them.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope truncated: {0} bytes")]
    Truncated(usize),
    #[error("unsupported nonce length {0}")]
    BadNonceLength(u32),
    #[error("envelope failed authentication")]
    AuthenticationFailed,
    #[error("cipher error: {0}")]
    Cipher(String),
}

/// Parsed view of an encrypted chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEnvelope {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl ChunkEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEN_PREFIX + NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&(NONCE_LEN as u32).to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < LEN_PREFIX {
            return Err(EnvelopeError::Truncated(bytes.len()));
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&bytes[..LEN_PREFIX]);
        let nonce_len = u32::from_be_bytes(prefix);
        if nonce_len as usize != NONCE_LEN {
            return Err(EnvelopeError::BadNonceLength(nonce_len));
        }
        let body = &bytes[LEN_PREFIX..];
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(EnvelopeError::Truncated(bytes.len()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&body[..NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&body[NONCE_LEN..NONCE_LEN + TAG_LEN]);

        Ok(Self {
            nonce,
            tag,
            ciphertext: body[NONCE_LEN + TAG_LEN..].to_vec(),
        })
    }
}

pub(crate) fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|e| EnvelopeError::Cipher(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| EnvelopeError::Cipher(e.to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(ChunkEnvelope {
        nonce,
        tag: tag_bytes,
        ciphertext: buffer,
    }
    .encode())
}

pub(crate) fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = ChunkEnvelope::decode(sealed)?;
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|e| EnvelopeError::Cipher(e.to_string()))?;

    let mut buffer = envelope.ciphertext;
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&envelope.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| EnvelopeError::AuthenticationFailed)?;
    Ok(buffer)
}
