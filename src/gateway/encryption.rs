use bytes::Bytes;
use xsalsa20poly1305::{
    XSalsa20Poly1305,
    aead::{AeadInPlace, KeyInit, generic_array::GenericArray},
};

use crate::{
    common::errors::VoiceError,
    gateway::{
        constants::{AEAD_NONCE_LEN, AEAD_TAG_LEN, ENCRYPTED_MODE, PLAIN_MODE, RTP_HEADER_LEN},
        packet::RtpHeader,
    },
};

const _: () = assert!(AEAD_TAG_LEN == xsalsa20poly1305::TAG_SIZE);
const _: () = assert!(AEAD_NONCE_LEN == xsalsa20poly1305::NONCE_SIZE);
const _: () = assert!(RTP_HEADER_LEN <= AEAD_NONCE_LEN);

/// Modes this transport can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    XSalsa20Poly1305,
    /// Compatibility mode: header followed by the raw payload, no tag.
    Plain,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::XSalsa20Poly1305 => ENCRYPTED_MODE,
            Self::Plain => PLAIN_MODE,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ENCRYPTED_MODE => Some(Self::XSalsa20Poly1305),
            PLAIN_MODE => Some(Self::Plain),
            _ => None,
        }
    }

    /// Picks the mode to request given what the server offered.
    pub fn negotiate(encrypt: bool, offered: &[String]) -> Result<Self, VoiceError> {
        if !encrypt {
            return Ok(Self::Plain);
        }
        if offered.iter().any(|m| m == ENCRYPTED_MODE) {
            Ok(Self::XSalsa20Poly1305)
        } else {
            Err(VoiceError::UnsupportedEncryptionMode {
                offered: offered.to_vec(),
            })
        }
    }
}

/// Exactly one cipher state exists per session.
enum ActiveCipher {
    XSalsa20Poly1305(XSalsa20Poly1305),
    Plain,
}

/// A media packet that made it through header parsing and authentication.
/// `buffer[offset..offset + length]` is the encoded frame.
#[derive(Debug, Clone)]
pub struct OpenedPacket {
    pub header: RtpHeader,
    pub buffer: Bytes,
    pub offset: usize,
    pub length: usize,
}

impl OpenedPacket {
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }
}

/// Per-packet sealing and opening under the session key.
///
/// The nonce is the packet's own RTP header zero-padded to 24 bytes, so it
/// never repeats under one key as long as the sequence/timestamp pair does
/// not wrap back onto an earlier value before the key is replaced.
pub struct SecureTransport {
    cipher: ActiveCipher,
}

impl SecureTransport {
    pub fn new(mode: EncryptionMode, secret_key: &[u8; 32]) -> Self {
        let cipher = match mode {
            EncryptionMode::XSalsa20Poly1305 => {
                ActiveCipher::XSalsa20Poly1305(XSalsa20Poly1305::new(&(*secret_key).into()))
            }
            EncryptionMode::Plain => ActiveCipher::Plain,
        };
        Self { cipher }
    }

    pub fn mode(&self) -> EncryptionMode {
        match self.cipher {
            ActiveCipher::XSalsa20Poly1305(_) => EncryptionMode::XSalsa20Poly1305,
            ActiveCipher::Plain => EncryptionMode::Plain,
        }
    }

    /// Writes `header || ciphertext || tag` (or `header || payload` in plain
    /// mode) into `out`, replacing its contents.
    pub fn seal(
        &self,
        header: &RtpHeader,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), VoiceError> {
        let header_bytes = header.to_bytes();
        out.clear();
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);

        if let ActiveCipher::XSalsa20Poly1305(cipher) = &self.cipher {
            let nonce = nonce_from_header(&header_bytes);
            let tag = cipher
                .encrypt_in_place_detached(&nonce.into(), b"", &mut out[RTP_HEADER_LEN..])
                .map_err(|_| VoiceError::Encryption)?;
            out.extend_from_slice(&tag);
        }
        Ok(())
    }

    /// Parses and authenticates one datagram. Anything short, foreign or
    /// tampered yields `None`.
    pub fn open(&self, datagram: &[u8]) -> Option<OpenedPacket> {
        let header = RtpHeader::parse(datagram)?;

        match &self.cipher {
            ActiveCipher::Plain => Some(OpenedPacket {
                header,
                buffer: Bytes::copy_from_slice(datagram),
                offset: RTP_HEADER_LEN,
                length: datagram.len() - RTP_HEADER_LEN,
            }),
            ActiveCipher::XSalsa20Poly1305(cipher) => {
                if datagram.len() < RTP_HEADER_LEN + AEAD_TAG_LEN {
                    return None;
                }
                let (body, tag) = datagram[RTP_HEADER_LEN..].split_at(
                    datagram.len() - RTP_HEADER_LEN - AEAD_TAG_LEN,
                );

                let mut header_bytes = [0u8; RTP_HEADER_LEN];
                header_bytes.copy_from_slice(&datagram[..RTP_HEADER_LEN]);
                let nonce = nonce_from_header(&header_bytes);

                let mut plain = body.to_vec();
                cipher
                    .decrypt_in_place_detached(
                        &nonce.into(),
                        b"",
                        &mut plain,
                        GenericArray::from_slice(tag),
                    )
                    .ok()?;

                let length = plain.len();
                Some(OpenedPacket {
                    header,
                    buffer: Bytes::from(plain),
                    offset: 0,
                    length,
                })
            }
        }
    }
}

fn nonce_from_header(header: &[u8; RTP_HEADER_LEN]) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[..RTP_HEADER_LEN].copy_from_slice(header);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::packet::RtpSequencer;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn sealed_packet_opens_to_original_payload() {
        let transport = SecureTransport::new(EncryptionMode::XSalsa20Poly1305, &KEY);
        let header = RtpHeader {
            sequence: 42,
            timestamp: 960 * 42,
            ssrc: 1234,
        };
        let payload = b"opus frame bytes";

        let mut packet = Vec::new();
        transport.seal(&header, payload, &mut packet).unwrap();
        assert_eq!(packet.len(), RTP_HEADER_LEN + payload.len() + AEAD_TAG_LEN);
        assert_ne!(&packet[RTP_HEADER_LEN..RTP_HEADER_LEN + payload.len()], payload);

        let opened = transport.open(&packet).unwrap();
        assert_eq!(opened.header, header);
        assert_eq!(opened.payload(), payload);
    }

    #[test]
    fn consecutive_packets_use_distinct_nonces() {
        let mut sequencer = RtpSequencer::new(99, 960);
        let nonces: Vec<[u8; AEAD_NONCE_LEN]> = (0..1_000)
            .map(|_| nonce_from_header(&sequencer.next_header().to_bytes()))
            .collect();

        let mut unique = nonces.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), nonces.len());
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let transport = SecureTransport::new(EncryptionMode::XSalsa20Poly1305, &KEY);
        let header = RtpHeader {
            sequence: 1,
            timestamp: 960,
            ssrc: 5,
        };
        let mut packet = Vec::new();
        transport.seal(&header, b"payload", &mut packet).unwrap();

        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(transport.open(&packet).is_none());
    }

    #[test]
    fn short_encrypted_datagram_is_rejected() {
        let transport = SecureTransport::new(EncryptionMode::XSalsa20Poly1305, &KEY);
        let header = RtpHeader {
            sequence: 1,
            timestamp: 1,
            ssrc: 1,
        }
        .to_bytes();
        let mut datagram = header.to_vec();
        datagram.extend_from_slice(&[0u8; AEAD_TAG_LEN - 1]);
        assert!(transport.open(&datagram).is_none());
    }

    #[test]
    fn plain_mode_carries_raw_payload() {
        let transport = SecureTransport::new(EncryptionMode::Plain, &[0u8; 32]);
        assert_eq!(transport.mode(), EncryptionMode::Plain);
        let header = RtpHeader {
            sequence: 3,
            timestamp: 4,
            ssrc: 5,
        };
        let mut packet = Vec::new();
        transport.seal(&header, b"raw", &mut packet).unwrap();
        assert_eq!(&packet[RTP_HEADER_LEN..], b"raw");

        let opened = transport.open(&packet).unwrap();
        assert_eq!(opened.offset, RTP_HEADER_LEN);
        assert_eq!(opened.payload(), b"raw");
    }

    #[test]
    fn negotiation_requires_encrypted_mode_when_enabled() {
        let offered = vec!["plain".to_string(), "xsalsa20_poly1305".to_string()];
        assert_eq!(
            EncryptionMode::negotiate(true, &offered).unwrap(),
            EncryptionMode::XSalsa20Poly1305
        );
        assert_eq!(
            EncryptionMode::negotiate(false, &offered).unwrap(),
            EncryptionMode::Plain
        );
        assert!(matches!(
            EncryptionMode::negotiate(true, &["aead_aes256_gcm".to_string()]),
            Err(VoiceError::UnsupportedEncryptionMode { .. })
        ));
    }
}
