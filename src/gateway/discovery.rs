//! IP discovery: one 70-byte datagram round-trip that tells us which
//! address/port the relay sees us as.
//!
//! Layout (both directions): `ssrc: u32 BE | address: NUL-padded text |
//! port: u16 LE`, the port occupying the last two bytes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::gateway::constants::{
    DISCOVERY_ADDRESS_OFFSET, DISCOVERY_PACKET_SIZE, DISCOVERY_PORT_OFFSET,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub address: String,
    pub port: u16,
}

/// The probe only carries our SSRC; the rest is zero.
pub fn build_probe(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    BigEndian::write_u32(&mut packet[0..4], ssrc);
    packet
}

pub fn encode_response(ssrc: u32, address: &str, port: u16) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = build_probe(ssrc);
    let text = address.as_bytes();
    let len = text
        .len()
        .min(DISCOVERY_PORT_OFFSET - DISCOVERY_ADDRESS_OFFSET);
    packet[DISCOVERY_ADDRESS_OFFSET..DISCOVERY_ADDRESS_OFFSET + len].copy_from_slice(&text[..len]);
    LittleEndian::write_u16(&mut packet[DISCOVERY_PORT_OFFSET..], port);
    packet
}

/// Anything that is not exactly one response datagram with a readable
/// address yields `None`.
pub fn parse_response(datagram: &[u8]) -> Option<DiscoveredAddress> {
    if datagram.len() != DISCOVERY_PACKET_SIZE {
        return None;
    }

    let address = std::str::from_utf8(&datagram[DISCOVERY_ADDRESS_OFFSET..DISCOVERY_PORT_OFFSET])
        .ok()?
        .trim_end_matches('\0');
    if address.is_empty() {
        return None;
    }

    Some(DiscoveredAddress {
        address: address.to_string(),
        port: LittleEndian::read_u16(&datagram[DISCOVERY_PORT_OFFSET..]),
    })
}
