use audiopus::{Application, Bitrate, Channels, SampleRate, coder::Encoder as OpusEncoder};
use byteorder::{ByteOrder, LittleEndian};

use super::AudioEncoder;
use crate::{
    common::{errors::VoiceError, types::AnyResult},
    configs::VoiceConfig,
};

/// PCM bytes → Opus packets at 48 kHz with the music profile.
pub struct OpusCodecEncoder {
    encoder: OpusEncoder,
    /// Reused i16 view of the incoming byte frame.
    samples: Vec<i16>,
}

impl OpusCodecEncoder {
    pub fn new(config: &VoiceConfig) -> Result<Self, VoiceError> {
        let channels = if config.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };
        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, channels, Application::Audio)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;

        let bitrate = match config.bitrate {
            Some(bps) => Bitrate::BitsPerSecond(bps),
            None => Bitrate::Auto,
        };
        encoder
            .set_bitrate(bitrate)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;

        Ok(Self {
            encoder,
            samples: Vec::with_capacity(config.frame_size_bytes() / 2),
        })
    }
}

impl AudioEncoder for OpusCodecEncoder {
    fn encode(&mut self, pcm: &[u8], output: &mut [u8]) -> AnyResult<usize> {
        read_samples(pcm, &mut self.samples);
        let size = self
            .encoder
            .encode(&self.samples, output)
            .map_err(|e| VoiceError::Codec(e.to_string()))?;
        Ok(size)
    }
}

/// Reinterprets 16-bit LE PCM as samples; a dangling odd byte is ignored.
fn read_samples(pcm: &[u8], samples: &mut Vec<i16>) {
    samples.resize(pcm.len() / 2, 0);
    LittleEndian::read_i16_into(&pcm[..samples.len() * 2], samples);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_bytes_become_little_endian_samples() {
        let mut samples = vec![9; 8];
        read_samples(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0x7f], &mut samples);
        assert_eq!(samples, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn encodes_a_silent_frame() {
        let config = VoiceConfig::default();
        let mut encoder = OpusCodecEncoder::new(&config).unwrap();
        let mut out = vec![0u8; crate::audio::constants::MAX_OPUS_FRAME_SIZE];
        let size = encoder
            .encode(&vec![0u8; config.frame_size_bytes()], &mut out)
            .unwrap();
        assert!(size > 0);
    }
}
