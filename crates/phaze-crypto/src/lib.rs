//! Cryptographic primitives for PhazeTunnel.
//!
//! This crate provides:
//! - Ephemeral X25519 key agreement and HKDF-SHA256 session key derivation
//! - ChaCha20-Poly1305 packet sealing with explicit `(epoch, sequence)` nonces
//! - Sliding-window replay protection
//! - Session ciphers that keep the previous key alive through a rekey
//! - HMAC credential proofs bound to the handshake's ephemeral key
//!
//! # Design
//!
//! UDP reorders and drops, so every packet carries its own sequence number
//! and the nonce is built from it rather than from an implicit counter.
//! Each direction of a session has its own key, and each rekey bumps the
//! epoch that prefixes the nonce, so a nonce is never reused under a key.

#![forbid(unsafe_code)]

pub mod aead;
pub mod auth;
pub mod keys;
pub mod replay;
pub mod session;

pub use aead::{OpeningKey, SealingKey, TAG_LEN};
pub use auth::{credential_proof, identity_tag, verify_credential_proof};
pub use keys::{
    derive_session_key, derive_shared_secret, generate_ephemeral_keypair, EphemeralPrivateKey,
    PublicKey, Role, Salt, SessionKey, SharedSecret,
};
pub use replay::ReplayWindow;
pub use session::{SessionCipher, SessionError};

use thiserror::Error;

/// Failures of local crypto operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("peer public key produced a non-contributory shared secret")]
    WeakPublicKey,

    #[error("key derivation failed")]
    Kdf,

    #[error("sequence {0} already used under this key")]
    NonceReuse(u32),

    #[error("sequence space exhausted, rekey required")]
    SequenceExhausted,

    #[error("plaintext too large: {0} bytes")]
    TooLarge(usize),

    #[error("encryption failed")]
    Encryption,
}

/// AEAD open failure.
///
/// Deliberately carries no detail: a wrong key, a flipped bit and a
/// truncated ciphertext all look the same to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("authentication failed")]
pub struct AuthError;
