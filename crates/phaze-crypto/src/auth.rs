//! Credential proofs carried in the handshake initiation.
//!
//! The proof is `HMAC-SHA256(secret, label || ephemeral_public || identity)`,
//! so it is bound to the handshake it was produced for and cannot be lifted
//! into another one.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const PROOF_LABEL: &[u8] = b"phaze-auth-v1";
const IDENTITY_LABEL: &[u8] = b"phaze-identity";

pub const PROOF_LEN: usize = 32;

fn proof_mac(secret: &[u8], public_key: &[u8; 32], identity: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(PROOF_LABEL);
    mac.update(public_key);
    mac.update(identity.as_bytes());
    mac
}

/// Compute the proof a client sends for `identity`.
pub fn credential_proof(secret: &[u8], public_key: &[u8; 32], identity: &str) -> [u8; PROOF_LEN] {
    proof_mac(secret, public_key, identity)
        .finalize()
        .into_bytes()
        .into()
}

/// Constant-time verification of a received proof.
pub fn verify_credential_proof(
    secret: &[u8],
    public_key: &[u8; 32],
    identity: &str,
    proof: &[u8],
) -> bool {
    proof_mac(secret, public_key, identity)
        .verify_slice(proof)
        .is_ok()
}

/// Stable non-reversible tag for an identity, kept after the claim itself
/// has been wiped.
pub fn identity_tag(identity: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_LABEL);
    hasher.update(identity.as_bytes());
    hasher.finalize().into()
}
