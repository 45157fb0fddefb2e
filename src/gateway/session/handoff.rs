use std::{
    collections::VecDeque,
    sync::OnceLock,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    common::{errors::VoiceError, types::UserId},
    gateway::{constants::MAX_PENDING_KEEPALIVES, encryption::SecureTransport},
};

/// Everything the media loops need once the session key has arrived.
pub struct MediaSession {
    pub ssrc: u32,
    pub transport: SecureTransport,
}

/// State the control channel hands to the media loops for one session.
///
/// The media session is a single-assignment cell: it is published exactly
/// once, right before the control channel reports `Connected`, and every
/// reader that sees it also sees the key inside it. A new handoff is created
/// for every session, so a reconnect starts with no key and an empty stream
/// table.
#[derive(Default)]
pub struct SessionHandoff {
    media: OnceLock<MediaSession>,
    streams: DashMap<u32, UserId>,
    keepalives: KeepaliveTracker,
}

/// Keepalive counters the send loop has put on the wire, oldest first, so
/// the receive loop can time the relay's echo.
#[derive(Default)]
pub struct KeepaliveTracker {
    sent: Mutex<VecDeque<(u64, Instant)>>,
}

impl KeepaliveTracker {
    /// Silently forgets the counter once too many are unanswered.
    pub fn record_sent(&self, counter: u64, at: Instant) {
        let mut sent = self.sent.lock();
        if sent.len() < MAX_PENDING_KEEPALIVES {
            sent.push_back((counter, at));
        }
    }

    /// Round-trip for an echoed counter. Older unanswered counters are
    /// dropped along with it; an unknown counter changes nothing.
    pub fn match_echo(&self, counter: u64, now: Instant) -> Option<Duration> {
        let mut sent = self.sent.lock();
        let index = sent.iter().position(|(c, _)| *c == counter)?;
        let (_, at) = sent.drain(..=index).last()?;
        Some(now.saturating_duration_since(at))
    }
}

impl SessionHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, media: MediaSession) -> Result<(), VoiceError> {
        self.media
            .set(media)
            .map_err(|_| VoiceError::Protocol("session key delivered twice".into()))
    }

    pub fn media(&self) -> Option<&MediaSession> {
        self.media.get()
    }

    pub fn is_published(&self) -> bool {
        self.media.get().is_some()
    }

    /// Best-effort: the server may reassign SSRCs without telling us.
    pub fn map_stream(&self, ssrc: u32, user_id: UserId) {
        self.streams.insert(ssrc, user_id);
    }

    pub fn user_for(&self, ssrc: u32) -> Option<UserId> {
        self.streams.get(&ssrc).map(|entry| *entry.value())
    }

    pub fn known_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn keepalives(&self) -> &KeepaliveTracker {
        &self.keepalives
    }
}
