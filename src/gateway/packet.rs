use byteorder::{BigEndian, ByteOrder};

use crate::gateway::constants::{RTP_HEADER_LEN, RTP_OPUS_PAYLOAD_TYPE, RTP_VERSION_BYTE};

/// The live fields of a 12-byte RTP header. The flag and payload-type bytes
/// are fixed for this transport and checked on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_OPUS_PAYLOAD_TYPE;
        BigEndian::write_u16(&mut header[2..4], self.sequence);
        BigEndian::write_u32(&mut header[4..8], self.timestamp);
        BigEndian::write_u32(&mut header[8..12], self.ssrc);
        header
    }

    /// Returns `None` for anything that is not one of our media packets;
    /// callers drop those silently.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < RTP_HEADER_LEN {
            return None;
        }
        if datagram[0] != RTP_VERSION_BYTE || datagram[1] != RTP_OPUS_PAYLOAD_TYPE {
            return None;
        }

        Some(Self {
            sequence: BigEndian::read_u16(&datagram[2..4]),
            timestamp: BigEndian::read_u32(&datagram[4..8]),
            ssrc: BigEndian::read_u32(&datagram[8..12]),
        })
    }
}

/// Hands out consecutive headers for one outbound stream. Both counters
/// wrap at their bit width.
#[derive(Debug)]
pub struct RtpSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
}

impl RtpSequencer {
    pub fn new(ssrc: u32, samples_per_frame: u32) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            samples_per_frame,
        }
    }

    pub fn next_header(&mut self) -> RtpHeader {
        let header = RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = RtpHeader {
            sequence: 0x0102,
            timestamp: 0x0304_0506,
            ssrc: 1234,
        };
        let bytes = header.to_bytes();
        assert_eq!(
            bytes,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x00, 0x04, 0xD2]
        );
        assert_eq!(RtpHeader::parse(&bytes), Some(header));
    }

    #[test]
    fn parse_rejects_short_and_foreign_datagrams() {
        assert_eq!(RtpHeader::parse(&[0x80, 0x78, 0, 0]), None);

        let mut bytes = RtpHeader {
            sequence: 1,
            timestamp: 2,
            ssrc: 3,
        }
        .to_bytes();
        bytes[0] = 0x90;
        assert_eq!(RtpHeader::parse(&bytes), None);

        bytes[0] = 0x80;
        bytes[1] = 0x60;
        assert_eq!(RtpHeader::parse(&bytes), None);
    }

    #[test]
    fn sequencer_advances_and_wraps() {
        let mut seq = RtpSequencer::new(7, 960);
        seq.sequence = u16::MAX;
        seq.timestamp = u32::MAX - 100;

        let first = seq.next_header();
        let second = seq.next_header();
        assert_eq!(first.sequence, u16::MAX);
        assert_eq!(second.sequence, 0);
        assert_eq!(second.timestamp, (u32::MAX - 100).wrapping_add(960));
        assert_eq!(second.ssrc, 7);
    }
}
