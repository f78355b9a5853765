//! Per-session cipher state.
//!
//! Combines the directional keys of the current epoch with a replay window,
//! and keeps the previous epoch's opening key alive for a grace period after
//! a rekey so packets already in flight still decrypt.
//!
//! The side that answers a rekey offer stages the new key instead of
//! switching to it: it keeps sealing under the current key until a packet
//! from the peer authenticates under the staged one, which proves the peer
//! has installed it.

use std::time::{Duration, Instant};

use phaze_core::handshake::CONFIRM_LABEL;
use thiserror::Error;

use crate::aead::{OpeningKey, SealingKey};
use crate::keys::{Role, SessionKey};
use crate::replay::ReplayWindow;
use crate::CryptoError;

/// Sequences this close to the end of the space trigger a rekey.
const SEQUENCE_HEADROOM: u32 = 1 << 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("replay detected: sequence {0}")]
    Replay(u32),

    #[error("authentication failed")]
    Auth,

    #[error("no key staged")]
    NotStaged,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug)]
struct CurrentKey {
    sealing: SealingKey,
    opening: OpeningKey,
    replay: ReplayWindow,
}

#[derive(Debug)]
struct PreviousKey {
    opening: OpeningKey,
    replay: ReplayWindow,
    expires_at: Instant,
}

#[derive(Debug)]
struct StagedKey {
    key: CurrentKey,
    grace: Duration,
}

/// Encrypted session state for one side of a tunnel.
#[derive(Debug)]
pub struct SessionCipher {
    role: Role,
    window_size: usize,
    current: CurrentKey,
    previous: Option<PreviousKey>,
    staged: Option<StagedKey>,
    installed_at: Instant,
    bytes_since_install: u64,
    peer_on_current: bool,
}

impl SessionCipher {
    pub fn new(key: SessionKey, role: Role, window_size: usize, now: Instant) -> Self {
        Self {
            role,
            window_size,
            current: Self::current_from(key, role, window_size),
            previous: None,
            staged: None,
            installed_at: now,
            bytes_since_install: 0,
            peer_on_current: true,
        }
    }

    fn current_from(key: SessionKey, role: Role, window_size: usize) -> CurrentKey {
        let (sealing, opening) = key.split(role);
        CurrentKey {
            sealing,
            opening,
            replay: ReplayWindow::new(window_size),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Epoch of the key used for sealing.
    pub fn epoch(&self) -> u32 {
        self.current.sealing.epoch()
    }

    pub fn next_tx_seq(&self) -> u32 {
        self.current.sealing.next_sequence()
    }

    pub fn highest_rx_seq(&self) -> Option<u32> {
        self.current.replay.highest()
    }

    pub fn has_previous_key(&self) -> bool {
        self.previous.is_some()
    }

    pub fn has_staged_key(&self) -> bool {
        self.staged.is_some()
    }

    /// True between a rekey and the first packet the peer seals under the
    /// new key.
    pub fn awaiting_peer_switch(&self) -> bool {
        self.previous.is_some() && !self.peer_on_current
    }

    /// Plaintext bytes sealed or opened under the current key.
    pub fn bytes_since_install(&self) -> u64 {
        self.bytes_since_install
    }

    /// When the current key was installed.
    pub fn installed_at(&self) -> Instant {
        self.installed_at
    }

    /// Seal under the current key. Returns `(sequence, ciphertext)`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), SessionError> {
        let seq = self.current.sealing.next_sequence();
        let ciphertext = self.current.sealing.seal(seq, plaintext)?;
        self.bytes_since_install += plaintext.len() as u64;
        Ok((seq, ciphertext))
    }

    /// Open a received payload.
    ///
    /// The replay window is consulted before decryption and only updated
    /// after the packet authenticates. During a rekey grace period the
    /// previous key is tried when the current one fails. A packet that
    /// opens under the staged key promotes it to current.
    pub fn decrypt(
        &mut self,
        seq: u32,
        ciphertext: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, SessionError> {
        let mut failure = SessionError::Auth;

        if self.current.replay.check(seq) {
            if let Ok(plaintext) = self.current.opening.open(seq, ciphertext) {
                self.current.replay.check_and_record(seq);
                self.bytes_since_install += plaintext.len() as u64;
                self.peer_on_current = true;
                return Ok(plaintext);
            }
        } else {
            failure = SessionError::Replay(seq);
        }

        if let Some(previous) = self.previous.as_mut().filter(|p| now < p.expires_at) {
            if previous.replay.check(seq) {
                if let Ok(plaintext) = previous.opening.open(seq, ciphertext) {
                    previous.replay.check_and_record(seq);
                    return Ok(plaintext);
                }
            } else {
                failure = SessionError::Replay(seq);
            }
        }

        if let Some(staged) = self.staged.as_mut().filter(|s| s.key.replay.check(seq)) {
            if let Ok(plaintext) = staged.key.opening.open(seq, ciphertext) {
                staged.key.replay.check_and_record(seq);
                if let Some(staged) = self.staged.take() {
                    self.rotate(staged.key, now, staged.grace);
                    self.peer_on_current = true;
                    self.bytes_since_install += plaintext.len() as u64;
                }
                return Ok(plaintext);
            }
        }

        Err(failure)
    }

    /// Seal the key confirmation under the current key.
    pub fn confirmation(&mut self) -> Result<(u32, Vec<u8>), SessionError> {
        let seq = self.current.sealing.next_sequence();
        let ciphertext = self.current.sealing.seal(seq, CONFIRM_LABEL)?;
        Ok((seq, ciphertext))
    }

    /// Check a confirmation sealed by the peer under the current key.
    ///
    /// The peer seals confirmations with a key it has only staged, so this
    /// does not count as the peer having switched.
    pub fn verify_confirmation(
        &mut self,
        seq: u32,
        confirmation: &[u8],
        now: Instant,
    ) -> Result<(), SessionError> {
        let peer_on_current = self.peer_on_current;
        let opened = self.decrypt(seq, confirmation, now);
        self.peer_on_current = peer_on_current;
        match opened? {
            plaintext if plaintext == CONFIRM_LABEL => Ok(()),
            _ => Err(SessionError::Auth),
        }
    }

    /// Switch to `key`; the old opening key stays usable for `grace`.
    pub fn install(&mut self, key: SessionKey, now: Instant, grace: Duration) {
        let next = Self::current_from(key, self.role, self.window_size);
        self.rotate(next, now, grace);
    }

    /// Hold `key` until the peer proves it uses it, replacing any key
    /// already staged. Sealing stays on the current key meanwhile.
    pub fn stage(&mut self, key: SessionKey, grace: Duration) {
        self.staged = Some(StagedKey {
            key: Self::current_from(key, self.role, self.window_size),
            grace,
        });
    }

    /// Seal the key confirmation under the staged key.
    pub fn staged_confirmation(&mut self) -> Result<(u32, Vec<u8>), SessionError> {
        let staged = self.staged.as_mut().ok_or(SessionError::NotStaged)?;
        let seq = staged.key.sealing.next_sequence();
        let ciphertext = staged.key.sealing.seal(seq, CONFIRM_LABEL)?;
        Ok((seq, ciphertext))
    }

    /// Switch to `key` only if `confirmation` proves the peer derived it.
    ///
    /// On failure the current key is left untouched.
    pub fn install_verified(
        &mut self,
        key: SessionKey,
        seq: u32,
        confirmation: &[u8],
        now: Instant,
        grace: Duration,
    ) -> Result<(), SessionError> {
        let mut next = Self::current_from(key, self.role, self.window_size);
        match next.opening.open(seq, confirmation) {
            Ok(plaintext) if plaintext == CONFIRM_LABEL => {}
            _ => return Err(SessionError::Auth),
        }
        next.replay.check_and_record(seq);
        self.rotate(next, now, grace);
        Ok(())
    }

    fn rotate(&mut self, next: CurrentKey, now: Instant, grace: Duration) {
        let old = std::mem::replace(&mut self.current, next);
        self.previous = Some(PreviousKey {
            opening: old.opening,
            replay: old.replay,
            expires_at: now + grace,
        });
        self.installed_at = now;
        self.bytes_since_install = 0;
        self.peer_on_current = false;
    }

    /// Drop the previous key once its grace period is over.
    pub fn expire_previous(&mut self, now: Instant) {
        if self.previous.as_ref().is_some_and(|p| now >= p.expires_at) {
            self.previous = None;
        }
    }

    /// Whether the current key has carried enough traffic, lived long
    /// enough, or used enough of its sequence space to be replaced.
    pub fn needs_rekey(&self, now: Instant, max_bytes: u64, max_age: Duration) -> bool {
        self.bytes_since_install >= max_bytes
            || now.saturating_duration_since(self.installed_at) >= max_age
            || self.next_tx_seq() >= u32::MAX - SEQUENCE_HEADROOM
    }
}
