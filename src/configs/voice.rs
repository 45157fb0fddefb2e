use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    audio::constants::{BYTES_PER_SAMPLE, SAMPLE_RATE},
    common::types::AnyResult,
    gateway::ExecutionStrategy,
};

/// Tunables for one voice client. Defaults follow the values the transport
/// has always shipped with: a one-second send buffer, 20 ms stereo frames,
/// a 30 s connect timeout and 1 s / 10 s reconnect delays.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct VoiceConfig {
    /// Target latency absorbed by the outgoing frame buffer.
    pub buffer_length_ms: u64,
    pub frame_duration_ms: u64,
    pub channels: u8,
    /// Opus bitrate in bits per second; `None` lets the encoder decide.
    pub bitrate: Option<i32>,
    pub enable_encryption: bool,
    /// `false` for outgoing-only sessions: the receive loop exits as soon as
    /// the discovery response arrives.
    pub receive_audio: bool,
    pub execution: ExecutionStrategy,
    pub connection_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub failed_reconnect_delay_ms: u64,
    pub discovery_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            buffer_length_ms: 1_000,
            frame_duration_ms: 20,
            channels: 2,
            bitrate: None,
            enable_encryption: true,
            receive_audio: true,
            execution: ExecutionStrategy::default(),
            connection_timeout_ms: 30_000,
            reconnect_delay_ms: 1_000,
            failed_reconnect_delay_ms: 10_000,
            discovery_timeout_ms: 5_000,
            keepalive_interval_ms: 5_000,
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> AnyResult<()> {
        if !matches!(self.frame_duration_ms, 10 | 20 | 40 | 60) {
            return Err(format!(
                "voice.frame_duration_ms must be 10, 20, 40 or 60 (got {})",
                self.frame_duration_ms
            )
            .into());
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(format!("voice.channels must be 1 or 2 (got {})", self.channels).into());
        }
        if self.buffer_length_ms == 0 {
            return Err("voice.buffer_length_ms must be greater than zero".into());
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    /// Samples per channel in one frame; also the RTP timestamp step.
    pub fn samples_per_frame(&self) -> u32 {
        (SAMPLE_RATE as u64 * self.frame_duration_ms / 1_000) as u32
    }

    /// Size in bytes of one interleaved 16-bit PCM frame.
    pub fn frame_size_bytes(&self) -> usize {
        self.samples_per_frame() as usize * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// `ceil(buffer_length / frame_duration)`, never zero.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_length_ms
            .div_ceil(self.frame_duration_ms.max(1))
            .max(1) as usize
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn failed_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.failed_reconnect_delay_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}
