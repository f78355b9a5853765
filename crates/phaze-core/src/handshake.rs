//! Handshake sub-messages carried in the payload of handshake packets.
//!
//! # Handshake Flow
//!
//! ```text
//! Client                                      Server
//!   |  HandshakeInit (sid=0)                    |
//!   |  e_c, identity, proof                     |
//!   |------------------------------------------>|  lookup + verify proof
//!   |                                           |  e_s, salt, DH, KDF
//!   |  HandshakeResponse (sid assigned)         |
//!   |  e_s, salt                                |
//!   |<------------------------------------------|
//!   |  HandshakeComplete                        |
//!   |  e_c, seal(k, "phaze-confirm")            |
//!   |------------------------------------------>|  verify, assign tunnel ip
//!   |  HandshakeComplete                        |
//!   |  seal(k, TunnelAssignment)                |
//!   |<------------------------------------------|
//! ```
//!
//! A rekey round reuses `HandshakeResponse` (server -> client, sealed under
//! the current key) and `HandshakeComplete` (client -> server, carrying the
//! client's fresh ephemeral key).

use std::net::Ipv4Addr;

use crate::{DecodeError, EncodeError, MAX_PAYLOAD_SIZE};

/// X25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// KDF salt length.
pub const SALT_LEN: usize = 32;

/// Identity is prefixed by a u8 length.
pub const MAX_IDENTITY_LEN: usize = u8::MAX as usize;

/// Upper bound on a credential proof, well under the u16 length prefix.
pub const MAX_PROOF_LEN: usize = 256;

/// Plaintext sealed into a client's HandshakeComplete.
pub const CONFIRM_LABEL: &[u8] = b"phaze-confirm";

/// Client hello: ephemeral key, identity claim, optional credential proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInit {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub identity: String,
    /// Empty when the client presents no proof.
    pub credential_proof: Vec<u8>,
}

impl HandshakeInit {
    /// Minimum encoded size (key + two empty length prefixes).
    pub const MIN_SIZE: usize = PUBLIC_KEY_LEN + 1 + 2;

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let identity = self.identity.as_bytes();
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(EncodeError::FieldTooLong("identity", identity.len()));
        }
        if self.credential_proof.len() > MAX_PROOF_LEN {
            return Err(EncodeError::FieldTooLong(
                "credential_proof",
                self.credential_proof.len(),
            ));
        }

        let mut buf =
            Vec::with_capacity(Self::MIN_SIZE + identity.len() + self.credential_proof.len());
        buf.extend_from_slice(&self.public_key);
        buf.push(identity.len() as u8);
        buf.extend_from_slice(identity);
        buf.extend_from_slice(&(self.credential_proof.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.credential_proof);

        Ok(buf)
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::MIN_SIZE {
            return Err(DecodeError::Malformed("handshake init too short"));
        }

        let public_key = read_key(&buf[..PUBLIC_KEY_LEN]);
        let mut offset = PUBLIC_KEY_LEN;

        let identity_len = buf[offset] as usize;
        offset += 1;
        let identity = buf
            .get(offset..offset + identity_len)
            .ok_or(DecodeError::Malformed("identity truncated"))?;
        let identity = std::str::from_utf8(identity)
            .map_err(|_| DecodeError::Malformed("identity not utf-8"))?
            .to_string();
        offset += identity_len;

        let len_bytes = buf
            .get(offset..offset + 2)
            .ok_or(DecodeError::Malformed("proof length truncated"))?;
        let proof_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        offset += 2;
        if proof_len > MAX_PROOF_LEN {
            return Err(DecodeError::Malformed("proof too long"));
        }

        let credential_proof = buf
            .get(offset..offset + proof_len)
            .ok_or(DecodeError::Malformed("proof truncated"))?
            .to_vec();
        offset += proof_len;

        if offset != buf.len() {
            return Err(DecodeError::Malformed("trailing bytes after handshake init"));
        }

        Ok(Self {
            public_key,
            identity,
            credential_proof,
        })
    }
}

/// Server answer: ephemeral key and the KDF salt. No proof on responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

impl HandshakeResponse {
    /// Encoded size in bytes.
    pub const SIZE: usize = PUBLIC_KEY_LEN + SALT_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.salt);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != Self::SIZE {
            return Err(DecodeError::Malformed("handshake response size"));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[PUBLIC_KEY_LEN..]);

        Ok(Self {
            public_key: read_key(&buf[..PUBLIC_KEY_LEN]),
            salt,
        })
    }
}

/// Client key confirmation.
///
/// `confirmation` is [`CONFIRM_LABEL`] sealed under the freshly derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub confirmation: Vec<u8>,
}

impl HandshakeComplete {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let len = PUBLIC_KEY_LEN + self.confirmation.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::PayloadTooLarge(len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.confirmation);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() <= PUBLIC_KEY_LEN {
            return Err(DecodeError::Malformed("handshake complete too short"));
        }

        Ok(Self {
            public_key: read_key(&buf[..PUBLIC_KEY_LEN]),
            confirmation: buf[PUBLIC_KEY_LEN..].to_vec(),
        })
    }
}

/// Tunnel addressing handed to a client once its session is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelAssignment {
    pub tunnel_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub server_ip: Ipv4Addr,
}

impl TunnelAssignment {
    /// Encoded size in bytes.
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.tunnel_ip.octets());
        buf[4] = self.prefix_len;
        buf[5..9].copy_from_slice(&self.server_ip.octets());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != Self::SIZE {
            return Err(DecodeError::Malformed("tunnel assignment size"));
        }
        if buf[4] > 32 {
            return Err(DecodeError::Malformed("prefix length"));
        }

        Ok(Self {
            tunnel_ip: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
            prefix_len: buf[4],
            server_ip: Ipv4Addr::new(buf[5], buf[6], buf[7], buf[8]),
        })
    }
}

/// Reasons carried in an Error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Unknown identity or bad credential proof.
    Unauthorized = 0x01,
    /// Session table at capacity.
    Capacity = 0x02,
    /// No tunnel address left.
    PoolExhausted = 0x03,
    /// Handshake message could not be parsed.
    Malformed = 0x04,
    /// Too many handshakes from this source.
    RateLimited = 0x05,
}

impl ErrorCode {
    pub fn encode(self) -> [u8; 1] {
        [self as u8]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        match buf {
            [code] => Self::try_from(*code),
            _ => Err(DecodeError::Malformed("error payload size")),
        }
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::Unauthorized),
            0x02 => Ok(Self::Capacity),
            0x03 => Ok(Self::PoolExhausted),
            0x04 => Ok(Self::Malformed),
            0x05 => Ok(Self::RateLimited),
            _ => Err(DecodeError::Malformed("unknown error code")),
        }
    }
}

fn read_key(buf: &[u8]) -> [u8; PUBLIC_KEY_LEN] {
    let mut key = [0u8; PUBLIC_KEY_LEN];
    key.copy_from_slice(buf);
    key
}
