use bytes::Bytes;

use crate::common::types::{ChannelId, UserId};

/// Events the transport reports to its owner.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// A user (including ourselves once connected) started or stopped
    /// transmitting.
    UserSpeaking { user_id: UserId, speaking: bool },

    /// One authenticated inbound media packet. The encoded frame is
    /// `buffer[offset..offset + length]`.
    PacketReceived {
        user_id: UserId,
        channel_id: ChannelId,
        buffer: Bytes,
        offset: usize,
        length: usize,
    },

    /// The session dropped. Fired for unexpected disconnects (a reconnect
    /// follows) and for fatal protocol errors (nothing follows).
    ConnectionLost { reason: String },
}

impl VoiceEvent {
    /// The encoded frame of a `PacketReceived` event.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::PacketReceived {
                buffer,
                offset,
                length,
                ..
            } => Some(&buffer[*offset..*offset + *length]),
            _ => None,
        }
    }
}
