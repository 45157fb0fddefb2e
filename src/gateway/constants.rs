/// Voice control-channel version requested in the websocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

// ── RTP ──────────────────────────────────────────────────────────────────────

/// Fixed RTP header: flags, payload type, sequence, timestamp, SSRC.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version 2, no padding, no extension, no CSRCs.
pub const RTP_VERSION_BYTE: u8 = 0x80;

/// Dynamic payload type used for Opus.
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;

/// Largest datagram we ever build or accept: header + max frame + tag.
pub const UDP_PACKET_BUF_CAPACITY: usize =
    RTP_HEADER_LEN + crate::audio::constants::MAX_OPUS_FRAME_SIZE + AEAD_TAG_LEN;

// ── IP discovery ─────────────────────────────────────────────────────────────

/// Probe and response are both exactly this long.
pub const DISCOVERY_PACKET_SIZE: usize = 70;

/// Address text starts after the echoed 4-byte SSRC.
pub const DISCOVERY_ADDRESS_OFFSET: usize = 4;

/// Little-endian port occupies the last two bytes.
pub const DISCOVERY_PORT_OFFSET: usize = 68;

// ── Keepalive ────────────────────────────────────────────────────────────────

/// UDP keepalive: a little-endian counter bumped before every send.
pub const KEEPALIVE_PACKET_SIZE: usize = 8;

/// Keepalives remembered while waiting for their echo; a minute's worth at
/// the default interval.
pub const MAX_PENDING_KEEPALIVES: usize = 12;

// ── Encryption modes ─────────────────────────────────────────────────────────

pub const ENCRYPTED_MODE: &str = "xsalsa20_poly1305";

/// Poly1305 tag appended after the ciphertext. This is the whole length
/// difference between an encrypted and a plain packet.
pub const AEAD_TAG_LEN: usize = 16;

/// XSalsa20 nonce: the RTP header zero-padded to this length.
pub const AEAD_NONCE_LEN: usize = 24;
pub const PLAIN_MODE: &str = "plain";

// ── Loop timing ──────────────────────────────────────────────────────────────

/// Upper bound on a single idle sleep inside the media loops (ms).
pub const MAX_IDLE_SLEEP_MS: u64 = 1;

/// Timeout (ms) allowed for the WS write task to flush and shut down.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;
