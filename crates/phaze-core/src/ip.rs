//! Minimal IP header inspection for routing decrypted packets.

use std::net::IpAddr;

const IPV4_MIN_HEADER_SIZE: usize = 20;
const IPV4_SRC_IP_OFF: usize = 12;
const IPV4_DST_IP_OFF: usize = 16;
const IPV4_IP_SZ: usize = 4;

const IPV6_MIN_HEADER_SIZE: usize = 40;
const IPV6_SRC_IP_OFF: usize = 8;
const IPV6_DST_IP_OFF: usize = 24;
const IPV6_IP_SZ: usize = 16;

/// Destination address of a raw IPv4/IPv6 packet.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_DST_IP_OFF, IPV6_DST_IP_OFF)
}

/// Source address of a raw IPv4/IPv6 packet.
pub fn source(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_SRC_IP_OFF, IPV6_SRC_IP_OFF)
}

fn address_at(packet: &[u8], v4_off: usize, v6_off: usize) -> Option<IpAddr> {
    let first = *packet.first()?;

    match first >> 4 {
        4 if packet.len() >= IPV4_MIN_HEADER_SIZE => {
            let mut addr = [0u8; IPV4_IP_SZ];
            addr.copy_from_slice(&packet[v4_off..v4_off + IPV4_IP_SZ]);
            Some(IpAddr::from(addr))
        }
        6 if packet.len() >= IPV6_MIN_HEADER_SIZE => {
            let mut addr = [0u8; IPV6_IP_SZ];
            addr.copy_from_slice(&packet[v6_off..v6_off + IPV6_IP_SZ]);
            Some(IpAddr::from(addr))
        }
        _ => None,
    }
}
