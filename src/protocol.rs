//! Wire framing: ArtDmx and E1.31 data packets as pure byte builders
//!
//! Sinks own sockets and pacing; this module only turns a 512-byte frame
//! into protocol packets. Layouts:
//!
//! - **ArtDmx** (Art-Net 4): 18-byte header + 512 data bytes. Opcode 0x5000
//!   little-endian, protocol version 14 big-endian, universe little-endian
//!   (SubUni then Net), length big-endian.
//! - **E1.31** (ANSI E1.31 sACN): root layer (ACN preamble + CID), framing
//!   layer (source name, priority, sequence, universe), DMP layer (start
//!   code + 512 property values). 638 bytes total.

use std::net::Ipv4Addr;

use crate::{Frame, UNIVERSE_SIZE};

/// Default Art-Net UDP port (0x1936).
pub const ARTNET_PORT: u16 = 6454;
/// E1.31 UDP port.
pub const E131_PORT: u16 = 5568;

const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
const ARTNET_OPCODE_OUTPUT: u16 = 0x5000;
const ARTNET_PROTOCOL_VERSION: u16 = 14;
const ARTNET_HEADER_LEN: usize = 18;

const ACN_PACKET_IDENTIFIER: [u8; 12] = [
    0x41, 0x53, 0x43, 0x2d, 0x45, 0x31, 0x2e, 0x31, 0x37, 0x00, 0x00, 0x00,
];
const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
const E131_PACKET_LEN: usize = 638;

/// Default sACN per-packet priority.
pub const E131_DEFAULT_PRIORITY: u8 = 100;

/// Build one ArtDmx packet for `universe` carrying `frame`.
///
/// `sequence` should cycle 1..=255; 0 tells receivers sequencing is unused.
pub fn art_dmx_packet(universe: u16, sequence: u8, frame: &Frame) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ARTNET_HEADER_LEN + UNIVERSE_SIZE);
    pkt.extend_from_slice(ARTNET_ID);
    pkt.extend_from_slice(&ARTNET_OPCODE_OUTPUT.to_le_bytes());
    pkt.extend_from_slice(&ARTNET_PROTOCOL_VERSION.to_be_bytes());
    pkt.push(sequence);
    pkt.push(0); // physical input port, informational only
    pkt.extend_from_slice(&universe.to_le_bytes());
    pkt.extend_from_slice(&(UNIVERSE_SIZE as u16).to_be_bytes());
    pkt.extend_from_slice(frame);
    pkt
}

/// Build one E1.31 data packet.
///
/// `source_name` is truncated to 63 bytes (the field is 64 bytes,
/// null-terminated). `sequence` wraps freely; receivers use it for
/// out-of-order detection only.
pub fn e131_data_packet(
    cid: &[u8; 16],
    source_name: &str,
    universe: u16,
    sequence: u8,
    priority: u8,
    frame: &Frame,
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(E131_PACKET_LEN);

    // Root layer
    pkt.extend_from_slice(&0x0010u16.to_be_bytes()); // preamble size
    pkt.extend_from_slice(&0x0000u16.to_be_bytes()); // postamble size
    pkt.extend_from_slice(&ACN_PACKET_IDENTIFIER);
    pkt.extend_from_slice(&flags_and_length(E131_PACKET_LEN - 16));
    pkt.extend_from_slice(&VECTOR_ROOT_E131_DATA.to_be_bytes());
    pkt.extend_from_slice(cid);

    // Framing layer
    pkt.extend_from_slice(&flags_and_length(E131_PACKET_LEN - 38));
    pkt.extend_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
    let mut name = [0u8; 64];
    let bytes = source_name.as_bytes();
    let n = bytes.len().min(63);
    name[..n].copy_from_slice(&bytes[..n]);
    pkt.extend_from_slice(&name);
    pkt.push(priority);
    pkt.extend_from_slice(&0u16.to_be_bytes()); // synchronization address
    pkt.push(sequence);
    pkt.push(0); // options
    pkt.extend_from_slice(&universe.to_be_bytes());

    // DMP layer
    pkt.extend_from_slice(&flags_and_length(E131_PACKET_LEN - 115));
    pkt.push(VECTOR_DMP_SET_PROPERTY);
    pkt.push(0xa1); // address type & data type
    pkt.extend_from_slice(&0u16.to_be_bytes()); // first property address
    pkt.extend_from_slice(&1u16.to_be_bytes()); // address increment
    pkt.extend_from_slice(&((UNIVERSE_SIZE + 1) as u16).to_be_bytes());
    pkt.push(0); // DMX start code
    pkt.extend_from_slice(frame);
    pkt
}

/// The sACN multicast group for a universe: 239.255.<hi>.<lo>.
pub fn e131_multicast_addr(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

// ACN PDU flags (0x7) in the top nibble, length in the low 12 bits.
fn flags_and_length(len: usize) -> [u8; 2] {
    (0x7000u16 | (len as u16 & 0x0fff)).to_be_bytes()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn art_dmx_layout() {
        let mut frame = [0u8; UNIVERSE_SIZE];
        frame[0] = 255;
        frame[511] = 7;
        let pkt = art_dmx_packet(3, 42, &frame);

        assert_eq!(pkt.len(), ARTNET_HEADER_LEN + UNIVERSE_SIZE);
        assert_eq!(&pkt[0..8], b"Art-Net\0");
        assert_eq!(u16::from_le_bytes([pkt[8], pkt[9]]), ARTNET_OPCODE_OUTPUT);
        assert_eq!(u16::from_be_bytes([pkt[10], pkt[11]]), 14);
        assert_eq!(pkt[12], 42); // sequence
        assert_eq!(u16::from_le_bytes([pkt[14], pkt[15]]), 3); // universe
        assert_eq!(u16::from_be_bytes([pkt[16], pkt[17]]), 512); // length
        assert_eq!(pkt[18], 255);
        assert_eq!(pkt[529], 7);
    }

    #[test]
    fn e131_layout() {
        let frame = [9u8; UNIVERSE_SIZE];
        let cid = [0xabu8; 16];
        let pkt = e131_data_packet(&cid, "cueflow", 1, 5, E131_DEFAULT_PRIORITY, &frame);

        assert_eq!(pkt.len(), E131_PACKET_LEN);
        assert_eq!(&pkt[4..16], &ACN_PACKET_IDENTIFIER);
        assert_eq!(&pkt[22..38], &cid);
        // root flags+length covers everything after the preamble
        assert_eq!(u16::from_be_bytes([pkt[16], pkt[17]]) & 0x0fff, 622);
        assert_eq!(&pkt[44..51], b"cueflow");
        assert_eq!(pkt[108], E131_DEFAULT_PRIORITY);
        assert_eq!(pkt[111], 5); // sequence
        assert_eq!(u16::from_be_bytes([pkt[113], pkt[114]]), 1); // universe
        // DMP: property value count = start code + 512
        assert_eq!(u16::from_be_bytes([pkt[123], pkt[124]]), 513);
        assert_eq!(pkt[125], 0); // start code
        assert_eq!(pkt[126], 9);
        assert_eq!(pkt[637], 9);
    }

    #[test]
    fn e131_source_name_truncated_and_terminated() {
        let frame = [0u8; UNIVERSE_SIZE];
        let long = "x".repeat(100);
        let pkt = e131_data_packet(&[0; 16], &long, 1, 0, 100, &frame);
        assert_eq!(pkt[44 + 62], b'x');
        assert_eq!(pkt[44 + 63], 0); // always null-terminated
    }

    #[test]
    fn multicast_group_encodes_universe() {
        assert_eq!(e131_multicast_addr(1), Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(e131_multicast_addr(256), Ipv4Addr::new(239, 255, 1, 0));
    }
}
