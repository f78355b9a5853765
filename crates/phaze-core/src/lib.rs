//! PhazeTunnel wire protocol types and framing.
//!
//! This crate provides:
//! - The fixed 12-byte packet header and packet type tags
//! - Handshake sub-messages exchanged before a session carries data
//! - Small helpers for peeking at IP headers inside decrypted payloads
//!
//! Everything here is pure data: no sockets, no crypto. Decoding is written
//! to be fed untrusted datagrams directly and never panics.

#![forbid(unsafe_code)]

pub mod handshake;
pub mod ip;
pub mod packet;

pub use handshake::{
    ErrorCode, HandshakeComplete, HandshakeInit, HandshakeResponse, TunnelAssignment,
};
pub use packet::{Packet, PacketHeader, PacketType};

use thiserror::Error;

/// Current protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Session id used by a client before the server has assigned one.
pub const UNASSIGNED_SESSION_ID: u32 = 0;

/// Header size: version(1) + type(1) + session_id(4) + sequence(4) + payload_len(2).
pub const HEADER_SIZE: usize = 12;

/// Maximum datagram size the tunnel will emit or accept.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Maximum payload size (packet - header).
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Sealed Keepalive body asking the peer to answer.
pub const KEEPALIVE_PROBE: u8 = 0x00;

/// Sealed Keepalive body answering a probe. Never answered itself.
pub const KEEPALIVE_REPLY: u8 = 0x01;

/// Errors produced while decoding untrusted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported version: {0}, expected {1}")]
    UnsupportedVersion(u8, u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
}

/// Errors produced while encoding locally built messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload too large: {0} bytes, maximum {1}")]
    PayloadTooLarge(usize, usize),

    #[error("buffer too small: {0} bytes, need {1}")]
    BufferTooSmall(usize, usize),

    #[error("field {0} too long: {1} bytes")]
    FieldTooLong(&'static str, usize),
}
