//! Packet framing.
//!
//! Every datagram starts with the same 12-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |     Type      |      Session ID (high)        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Session ID (low)         |       Sequence (high)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Sequence (low)          |        Payload Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All integers are big-endian. One packet per datagram: the payload length
//! must account for every remaining byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    DecodeError, EncodeError, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

/// Packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client offering an ephemeral key and identity.
    HandshakeInit = 0x01,
    /// Server answering with its ephemeral key and KDF salt.
    HandshakeResponse = 0x02,
    /// Key confirmation, closing a handshake or rekey round.
    HandshakeComplete = 0x03,
    /// Encrypted IP packet.
    Data = 0x10,
    /// Liveness probe.
    Keepalive = 0x20,
    /// Orderly session teardown.
    Disconnect = 0x30,
    /// Handshake rejection.
    Error = 0x7f,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::HandshakeInit),
            0x02 => Ok(Self::HandshakeResponse),
            0x03 => Ok(Self::HandshakeComplete),
            0x10 => Ok(Self::Data),
            0x20 => Ok(Self::Keepalive),
            0x30 => Ok(Self::Disconnect),
            0x7f => Ok(Self::Error),
            _ => Err(DecodeError::UnknownPacketType(value)),
        }
    }
}

/// Packet header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version.
    pub version: u8,
    /// Packet type.
    pub packet_type: PacketType,
    /// Session identifier, 0 before assignment.
    pub session_id: u32,
    /// Per-session, per-direction sequence number.
    pub sequence: u32,
    /// Length of the payload that follows.
    pub payload_len: u16,
}

impl PacketHeader {
    /// Encode header to bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(EncodeError::BufferTooSmall(buf.len(), HEADER_SIZE));
        }

        buf[0] = self.version;
        buf[1] = self.packet_type as u8;
        buf[2..6].copy_from_slice(&self.session_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.sequence.to_be_bytes());
        buf[10..12].copy_from_slice(&self.payload_len.to_be_bytes());

        Ok(HEADER_SIZE)
    }

    /// Decode header from bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Malformed("truncated header"));
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version, PROTOCOL_VERSION));
        }

        let packet_type = PacketType::try_from(buf[1])?;
        let session_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let sequence = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let payload_len = u16::from_be_bytes([buf[10], buf[11]]);

        Ok(Self {
            version,
            packet_type,
            session_id,
            sequence,
            payload_len,
        })
    }

    /// Quick check if a buffer might be a valid packet.
    ///
    /// This is a fast pre-check before full parsing.
    pub fn quick_check(buf: &[u8]) -> bool {
        buf.len() >= HEADER_SIZE && buf.len() <= MAX_PACKET_SIZE && buf[0] == PROTOCOL_VERSION
    }
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub session_id: u32,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet at the current protocol version.
    pub fn new(
        packet_type: PacketType,
        session_id: u32,
        sequence: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            session_id,
            sequence,
            payload: payload.into(),
        }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            version: self.version,
            packet_type: self.packet_type,
            session_id: self.session_id,
            sequence: self.sequence,
            payload_len: self.payload.len() as u16,
        }
    }

    /// Serialize header and payload into one datagram.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::PayloadTooLarge(
                self.payload.len(),
                MAX_PAYLOAD_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.session_id);
        buf.put_u32(self.sequence);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Parse one datagram.
    ///
    /// The declared payload length is only trusted after it has been checked
    /// against the bytes actually present, so nothing is allocated on the
    /// strength of an attacker-supplied length.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::Malformed("datagram exceeds mtu"));
        }

        let header = PacketHeader::decode(buf)?;
        let body = &buf[HEADER_SIZE..];
        let payload_len = header.payload_len as usize;

        if payload_len != body.len() {
            return Err(DecodeError::Malformed("payload length mismatch"));
        }

        Ok(Self {
            version: header.version,
            packet_type: header.packet_type,
            session_id: header.session_id,
            sequence: header.sequence,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Data,
            session_id: 0xdead_beef,
            sequence: 42,
            payload_len: 7,
        };

        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();

        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_packet_layout_is_big_endian() {
        let packet = Packet::new(PacketType::Keepalive, 0x0102_0304, 0x0a0b_0c0d, vec![0xee]);
        let bytes = packet.encode().unwrap();

        assert_eq!(
            &bytes[..],
            &[1, 0x20, 1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d, 0, 1, 0xee]
        );
    }

    #[test]
    fn test_quick_check() {
        let mut buf = [0u8; 32];
        buf[0] = PROTOCOL_VERSION;

        assert!(PacketHeader::quick_check(&buf));
        assert!(!PacketHeader::quick_check(&[0x00; 32])); // Wrong version
        assert!(!PacketHeader::quick_check(&[PROTOCOL_VERSION; 4])); // Too short
        assert!(!PacketHeader::quick_check(&[PROTOCOL_VERSION; MAX_PACKET_SIZE + 1]));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let packet = Packet::new(PacketType::Data, 9, 1, vec![1, 2, 3, 4]);
        let bytes = packet.encode().unwrap();

        for len in 0..bytes.len() {
            let result = Packet::decode(&bytes[..len]);
            assert!(
                matches!(result, Err(DecodeError::Malformed(_))),
                "length {} should be malformed",
                len
            );
        }
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let packet = Packet::new(PacketType::Data, 9, 1, vec![1, 2, 3]);
        let mut bytes = packet.encode().unwrap().to_vec();
        bytes.push(0);

        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::Malformed("payload length mismatch"))
        );
    }

    #[test]
    fn test_bad_version_and_type() {
        let mut bytes = Packet::new(PacketType::Keepalive, 1, 0, Bytes::new())
            .encode()
            .unwrap()
            .to_vec();

        bytes[1] = 0x55;
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::UnknownPacketType(0x55))
        );

        bytes[0] = 9;
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::UnsupportedVersion(9, PROTOCOL_VERSION))
        );
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let packet = Packet::new(PacketType::Data, 1, 1, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            packet.encode(),
            Err(EncodeError::PayloadTooLarge(_, MAX_PAYLOAD_SIZE))
        ));

        let packet = Packet::new(PacketType::Data, 1, 1, vec![0u8; MAX_PAYLOAD_SIZE]);
        assert_eq!(packet.encode().unwrap().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_inflated_length_field_does_not_allocate() {
        // Header claims 65535 bytes of payload but carries none.
        let buf = [PROTOCOL_VERSION, 0x10, 0, 0, 0, 1, 0, 0, 0, 1, 0xff, 0xff];
        assert!(matches!(
            Packet::decode(&buf),
            Err(DecodeError::Malformed(_))
        ));
    }
}
