//! Ephemeral key agreement and session key derivation.
//!
//! Every handshake (and every rekey round) generates a fresh X25519 key on
//! each side. The private half is consumed by the Diffie-Hellman step, so it
//! cannot outlive the handshake. The shared secret is stretched with
//! HKDF-SHA256 into one key per direction; the salt is chosen by the server
//! and sent in the clear, the derived keys never leave the process.

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::EphemeralSecret;
use zeroize::Zeroizing;

use crate::aead::{OpeningKey, SealingKey, KEY_LEN};
use crate::CryptoError;

pub use x25519_dalek::PublicKey;

/// HKDF info prefix; the key epoch is appended.
const KDF_INFO: &[u8] = b"phaze-session-v1";

/// Which end of the tunnel a key is used by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Single-use X25519 private key.
pub struct EphemeralPrivateKey(EphemeralSecret);

impl fmt::Debug for EphemeralPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralPrivateKey(..)")
    }
}

/// Raw Diffie-Hellman output. Zeroized on drop.
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// KDF salt, transmitted in the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    pub fn random() -> Self {
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }
}

/// Directional key material for one epoch of a session.
pub struct SessionKey {
    epoch: u32,
    client_to_server: Zeroizing<[u8; KEY_LEN]>,
    server_to_client: Zeroizing<[u8; KEY_LEN]>,
}

impl SessionKey {
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Split into the sealing and opening halves for one side.
    pub fn split(self, role: Role) -> (SealingKey, OpeningKey) {
        let (send, recv) = match role {
            Role::Client => (self.client_to_server, self.server_to_client),
            Role::Server => (self.server_to_client, self.client_to_server),
        };

        (
            SealingKey::new(send, self.epoch),
            OpeningKey::new(recv, self.epoch),
        )
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh keypair for one handshake.
pub fn generate_ephemeral_keypair() -> (EphemeralPrivateKey, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (EphemeralPrivateKey(secret), public)
}

/// Diffie-Hellman between our ephemeral key and the peer's public key.
///
/// Consumes the private key. Low-order peer points, which would force an
/// all-zero secret, are rejected.
pub fn derive_shared_secret(
    local: EphemeralPrivateKey,
    remote: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let shared = local.0.diffie_hellman(remote);
    if !shared.was_contributory() {
        return Err(CryptoError::WeakPublicKey);
    }
    Ok(SharedSecret(shared))
}

/// Derive the session key for `epoch`.
///
/// When `context_salt` is `None` (the server side) a random salt is drawn;
/// the salt actually used is returned so it can be sent to the peer.
pub fn derive_session_key(
    shared: &SharedSecret,
    context_salt: Option<Salt>,
    epoch: u32,
) -> Result<(SessionKey, Salt), CryptoError> {
    let salt = context_salt.unwrap_or_else(Salt::random);
    let hk = Hkdf::<Sha256>::new(Some(&salt.0), shared.as_bytes());

    let mut info = Vec::with_capacity(KDF_INFO.len() + 4);
    info.extend_from_slice(KDF_INFO);
    info.extend_from_slice(&epoch.to_be_bytes());

    let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
    hk.expand(&info, &mut okm[..])
        .map_err(|_| CryptoError::Kdf)?;

    let mut client_to_server = Zeroizing::new([0u8; KEY_LEN]);
    let mut server_to_client = Zeroizing::new([0u8; KEY_LEN]);
    client_to_server.copy_from_slice(&okm[..KEY_LEN]);
    server_to_client.copy_from_slice(&okm[KEY_LEN..]);

    Ok((
        SessionKey {
            epoch,
            client_to_server,
            server_to_client,
        },
        salt,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let (client_priv, client_pub) = generate_ephemeral_keypair();
        let (server_priv, server_pub) = generate_ephemeral_keypair();

        let server_shared = derive_shared_secret(server_priv, &client_pub).unwrap();
        let client_shared = derive_shared_secret(client_priv, &server_pub).unwrap();
        assert_eq!(server_shared.as_bytes(), client_shared.as_bytes());

        let (server_key, salt) = derive_session_key(&server_shared, None, 0).unwrap();
        let (client_key, client_salt) = derive_session_key(&client_shared, Some(salt), 0).unwrap();
        assert_eq!(salt, client_salt);

        let (mut server_seal, server_open) = server_key.split(Role::Server);
        let (mut client_seal, client_open) = client_key.split(Role::Client);

        let ct = client_seal.seal(0, b"up").unwrap();
        assert_eq!(server_open.open(0, &ct).unwrap(), b"up");

        let ct = server_seal.seal(0, b"down").unwrap();
        assert_eq!(client_open.open(0, &ct).unwrap(), b"down");
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let (a_priv, _) = generate_ephemeral_keypair();
        let (_, b_pub) = generate_ephemeral_keypair();
        let shared = derive_shared_secret(a_priv, &b_pub).unwrap();
        let (key, _) = derive_session_key(&shared, None, 0).unwrap();

        let (mut seal, open) = key.split(Role::Server);
        let ct = seal.seal(0, b"loopback").unwrap();
        // Our own sealing key must not open with our opening key.
        assert!(open.open(0, &ct).is_err());
    }

    #[test]
    fn test_epoch_and_salt_change_the_key() {
        let (a_priv, _) = generate_ephemeral_keypair();
        let (_, b_pub) = generate_ephemeral_keypair();
        let shared = derive_shared_secret(a_priv, &b_pub).unwrap();
        let salt = Salt([5u8; 32]);

        let (k0, _) = derive_session_key(&shared, Some(salt), 0).unwrap();
        let (k1, _) = derive_session_key(&shared, Some(salt), 1).unwrap();
        let (k0b, _) = derive_session_key(&shared, Some(Salt([6u8; 32])), 0).unwrap();
        assert_eq!(k1.epoch(), 1);

        let (mut seal0, _) = k0.split(Role::Client);
        let ct = seal0.seal(7, b"payload").unwrap();

        let (_, open1) = k1.split(Role::Server);
        let (_, open0b) = k0b.split(Role::Server);
        assert!(open1.open(7, &ct).is_err());
        assert!(open0b.open(7, &ct).is_err());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let (private, _) = generate_ephemeral_keypair();
        let zero = PublicKey::from([0u8; 32]);
        assert_eq!(
            derive_shared_secret(private, &zero).err(),
            Some(CryptoError::WeakPublicKey)
        );
    }
}
