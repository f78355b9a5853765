//! ChaCha20-Poly1305 packet sealing.
//!
//! Nonce layout (12 bytes): `epoch (u32 BE) || 0u32 || sequence (u32 BE)`.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use phaze_core::MAX_PACKET_SIZE;
use zeroize::Zeroizing;

use crate::{AuthError, CryptoError};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

fn nonce(epoch: u32, sequence: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[8..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Outbound half of a session key.
///
/// Refuses to seal the same or an older sequence twice, so a nonce is never
/// reused under this key.
pub struct SealingKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    epoch: u32,
    last: Option<u32>,
}

impl SealingKey {
    pub(crate) fn new(key: Zeroizing<[u8; KEY_LEN]>, epoch: u32) -> Self {
        Self {
            key,
            epoch,
            last: None,
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Lowest sequence number that can still be sealed.
    pub fn next_sequence(&self) -> u32 {
        self.last.map_or(0, |last| last.saturating_add(1))
    }

    pub fn seal(&mut self, sequence: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PACKET_SIZE {
            return Err(CryptoError::TooLarge(plaintext.len()));
        }
        if sequence == u32::MAX {
            return Err(CryptoError::SequenceExhausted);
        }
        if matches!(self.last, Some(last) if sequence <= last) {
            return Err(CryptoError::NonceReuse(sequence));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let nonce = nonce(self.epoch, sequence);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        self.last = Some(sequence);
        Ok(ciphertext)
    }
}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealingKey")
            .field("epoch", &self.epoch)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

/// Inbound half of a session key.
pub struct OpeningKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    epoch: u32,
}

impl OpeningKey {
    pub(crate) fn new(key: Zeroizing<[u8; KEY_LEN]>, epoch: u32) -> Self {
        Self { key, epoch }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Authenticate and decrypt. Does not consult any replay state.
    pub fn open(&self, sequence: u32, ciphertext: &[u8]) -> Result<Vec<u8>, AuthError> {
        if ciphertext.len() < TAG_LEN || ciphertext.len() > MAX_PACKET_SIZE {
            return Err(AuthError);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let nonce = nonce(self.epoch, sequence);
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| AuthError)
    }
}

impl fmt::Debug for OpeningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpeningKey")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
