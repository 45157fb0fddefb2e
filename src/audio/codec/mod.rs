pub mod opus_encoder;

pub use opus_encoder::OpusCodecEncoder;

use std::sync::Arc;

use crate::{common::types::AnyResult, configs::VoiceConfig};

/// Turns one PCM frame into one encoded media payload.
///
/// The send loop owns its encoder exclusively, so implementations only need
/// to be `Send`.
pub trait AudioEncoder: Send {
    /// Encode exactly one frame of interleaved 16-bit LE PCM into `output`,
    /// returning the number of bytes written.
    fn encode(&mut self, pcm: &[u8], output: &mut [u8]) -> AnyResult<usize>;
}

/// Builds a fresh encoder for every session, since encoder state must not
/// leak across reconnects.
pub type EncoderFactory =
    Arc<dyn Fn(&VoiceConfig) -> AnyResult<Box<dyn AudioEncoder>> + Send + Sync>;

pub fn opus_encoder_factory() -> EncoderFactory {
    Arc::new(|config: &VoiceConfig| {
        let encoder = OpusCodecEncoder::new(config)?;
        Ok(Box::new(encoder) as Box<dyn AudioEncoder>)
    })
}
