//! Audio format constants shared by the frame buffer, the encoder and the
//! RTP packetizer.

/// Sample rate of every frame on the wire (Hz).
pub const SAMPLE_RATE: u32 = 48_000;

/// Interleaved signed 16-bit little-endian PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Largest encoded frame we are prepared to send or receive.
pub const MAX_OPUS_FRAME_SIZE: usize = 4_000;

/// How long a blocked producer sleeps on the condvar before re-checking its
/// cancellation signal (ms).
pub const CANCEL_POLL_MS: u64 = 10;
