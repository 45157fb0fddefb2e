use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    ClientInner,
    handoff::{MediaSession, SessionHandoff},
    heartbeat::{now_ms, spawn_heartbeat},
    types::{ConnectionState, ControlMessage, SessionOutcome, SessionParams, VoiceGatewayMessage},
};
use crate::{
    common::{errors::VoiceError, types::UserId},
    gateway::{
        discovery::DiscoveredAddress,
        encryption::{EncryptionMode, SecureTransport},
        scheduler::{self, LoopHandle},
        udp_link::{MediaChannel, Pacer},
    },
    protocol::VoiceEvent,
};

/// A discovery response we are still waiting for, and until when.
pub(super) type PendingDiscovery = (flume::Receiver<DiscoveredAddress>, Instant);

/// Resolves with the discovery response, or `None` once the deadline passes
/// or the receive loop is gone. Never resolves while nothing is pending.
pub(super) async fn wait_discovery(pending: Option<PendingDiscovery>) -> Option<DiscoveredAddress> {
    let Some((rx, deadline)) = pending else {
        return std::future::pending().await;
    };
    tokio::time::timeout_at(deadline, rx.recv_async())
        .await
        .ok()
        .and_then(Result::ok)
}

/// Sender side of a `Connected` control channel, kept on the client so
/// speaking changes can go out between server messages.
pub(crate) struct ControlLink {
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    ssrc: u32,
    user_id: UserId,
}

impl ControlLink {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn send_speaking(&self, speaking: bool) {
        send_control(
            &self.tx,
            ControlMessage::Speaking {
                user_id: None,
                ssrc: self.ssrc,
                speaking,
                delay: 0,
            },
        );
    }
}

fn send_control(tx: &tokio::sync::mpsc::UnboundedSender<Message>, message: ControlMessage) {
    if let Ok(json) = serde_json::to_string(&message.into_raw()) {
        let _ = tx.send(Message::Text(json.into()));
    }
}

/// Per-connection state of the control channel. Lives exactly as long as
/// one websocket; a reconnect builds a fresh one.
pub(crate) struct SessionState<'a> {
    client: &'a ClientInner,
    params: &'a SessionParams,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    handoff: Arc<SessionHandoff>,
    state: ConnectionState,
    ssrc: u32,
    mode: Option<EncryptionMode>,
    channel: Option<MediaChannel>,
    loops: Vec<LoopHandle>,
    discovery: Option<PendingDiscovery>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
    awaiting_ack: Arc<AtomicBool>,
    faults_tx: flume::Sender<String>,
    faults_rx: flume::Receiver<String>,
    reached_connected: bool,
}

impl<'a> SessionState<'a> {
    pub fn new(
        client: &'a ClientInner,
        params: &'a SessionParams,
        tx: tokio::sync::mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        let (faults_tx, faults_rx) = flume::unbounded();
        Self {
            client,
            params,
            tx,
            cancel,
            handoff: Arc::new(SessionHandoff::new()),
            state: ConnectionState::Connecting,
            ssrc: 0,
            mode: None,
            channel: None,
            loops: Vec::with_capacity(2),
            discovery: None,
            heartbeat_handle: None,
            awaiting_ack: Arc::new(AtomicBool::new(false)),
            faults_tx,
            faults_rx,
            reached_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reached_connected(&self) -> bool {
        self.reached_connected
    }

    pub(super) fn pending_discovery(&self) -> Option<PendingDiscovery> {
        self.discovery.clone()
    }

    /// Reasons the session has to be dropped that arrive from outside the
    /// read loop, such as a missed heartbeat.
    pub(super) fn faults(&self) -> flume::Receiver<String> {
        self.faults_rx.clone()
    }

    pub fn identify(&mut self) {
        self.send_message(self.params.identify());
        self.set_state(ConnectionState::AwaitingReady);
    }

    pub async fn handle_text(&mut self, text: &str) -> Option<SessionOutcome> {
        let raw: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "[{}] Failed to parse voice gateway message: {} - Text: {}",
                    self.params.guild_id, e, text
                );
                return None;
            }
        };

        match ControlMessage::from_raw(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!("[{}] {}", self.params.guild_id, e);
                Some(SessionOutcome::Reconnect(e.to_string()))
            }
        }
    }

    pub async fn handle_message(&mut self, message: ControlMessage) -> Option<SessionOutcome> {
        match message {
            ControlMessage::Ready {
                ssrc,
                port,
                modes,
                heartbeat_interval,
                ip,
            } => {
                self.handle_ready(ssrc, port, modes, heartbeat_interval, ip)
                    .await
            }
            ControlMessage::SessionKey { secret_key, mode } => {
                self.handle_session_key(secret_key, mode)
            }
            ControlMessage::Speaking {
                user_id,
                ssrc,
                speaking,
                ..
            } => {
                self.handle_speaking(user_id, ssrc, speaking);
                None
            }
            ControlMessage::Hello { heartbeat_interval } => {
                self.start_heartbeat(heartbeat_interval);
                None
            }
            // Older servers echo op 3 itself instead of sending an ack.
            ControlMessage::Heartbeat { nonce } | ControlMessage::HeartbeatAck { nonce } => {
                self.record_latency(nonce);
                None
            }
            ControlMessage::Identify { .. } | ControlMessage::SelectProtocol { .. } => {
                debug!(
                    "[{}] Ignoring client-bound message from server",
                    self.params.guild_id
                );
                None
            }
            ControlMessage::Unknown { op } => {
                debug!("[{}] Received voice op {}", self.params.guild_id, op);
                None
            }
        }
    }

    async fn handle_ready(
        &mut self,
        ssrc: u32,
        port: u16,
        modes: Vec<String>,
        heartbeat_interval: Option<u64>,
        ip: Option<String>,
    ) -> Option<SessionOutcome> {
        if self.state != ConnectionState::AwaitingReady {
            warn!(
                "[{}] Ignoring Ready in state {:?}",
                self.params.guild_id, self.state
            );
            return None;
        }

        let mode = match EncryptionMode::negotiate(self.client.config.enable_encryption, &modes) {
            Ok(mode) => mode,
            Err(e) => {
                error!("[{}] {}", self.params.guild_id, e);
                return Some(SessionOutcome::Abort(e));
            }
        };

        if let Some(interval) = heartbeat_interval {
            self.start_heartbeat(interval);
        }

        let host = ip.unwrap_or_else(|| self.params.relay_host().to_string());
        let remote = match resolve(&host, port).await {
            Ok(addr) => addr,
            Err(e) => {
                return Some(SessionOutcome::Reconnect(format!(
                    "could not resolve relay {}:{}: {}",
                    host, port, e
                )));
            }
        };

        debug!(
            "[{}] Ready! Relay: {}, SSRC: {}, Mode: {}",
            self.params.guild_id,
            remote,
            ssrc,
            mode.as_str()
        );
        self.ssrc = ssrc;
        self.mode = Some(mode);

        if let Err(e) = self.start_media(remote) {
            error!("[{}] Failed to start media channel: {}", self.params.guild_id, e);
            return Some(if e.is_fatal() {
                SessionOutcome::Abort(e)
            } else {
                SessionOutcome::Reconnect(e.to_string())
            });
        }
        self.set_state(ConnectionState::Ready);
        None
    }

    /// Opens the datagram socket, starts both loops and fires the probe.
    fn start_media(&mut self, remote: SocketAddr) -> Result<(), VoiceError> {
        let client = self.client;
        let config = &client.config;
        let channel = MediaChannel::open(remote)?;
        let encoder =
            (client.encoder_factory)(config).map_err(|e| VoiceError::Codec(e.to_string()))?;
        let (discovery_tx, discovery_rx) = flume::unbounded();

        let receive = channel.receive_loop(
            self.params.guild_id.clone(),
            self.params.channel_id,
            self.handoff.clone(),
            client.events.clone(),
            discovery_tx,
            client.udp_ping.clone(),
            config.receive_audio,
        );
        let send = channel.send_loop(
            self.params.guild_id.clone(),
            client.buffer.clone(),
            self.handoff.clone(),
            encoder,
            Pacer::new(config.frame_duration(), config.keepalive_interval()),
            config.samples_per_frame(),
        );

        self.loops
            .push(scheduler::spawn(config.execution, receive, self.cancel.clone())?);
        self.loops
            .push(scheduler::spawn(config.execution, send, self.cancel.clone())?);
        self.channel = Some(channel);

        self.discovery = Some((discovery_rx, Instant::now() + config.discovery_timeout()));
        if let Some(channel) = &self.channel {
            channel.send_probe(self.ssrc)?;
        }
        Ok(())
    }

    pub fn handle_discovery(&mut self, found: DiscoveredAddress) {
        self.discovery = None;
        let Some(mode) = self.mode else {
            return;
        };

        debug!(
            "[{}] External address {}:{}, selecting protocol",
            self.params.guild_id, found.address, found.port
        );
        self.send_message(ControlMessage::SelectProtocol {
            address: found.address,
            port: found.port,
            mode: mode.as_str().to_string(),
        });
        self.set_state(ConnectionState::AwaitingSessionKey);
    }

    fn handle_session_key(&mut self, secret_key: [u8; 32], mode_name: String) -> Option<SessionOutcome> {
        match self.state {
            ConnectionState::AwaitingSessionKey => {}
            ConnectionState::Connected => {
                warn!("[{}] Ignoring repeated session key", self.params.guild_id);
                return None;
            }
            other => {
                return Some(SessionOutcome::Reconnect(format!(
                    "session key received in state {:?}",
                    other
                )));
            }
        }

        let mode = match EncryptionMode::from_name(&mode_name) {
            Some(mode) if Some(mode) == self.mode => mode,
            _ => {
                let e = VoiceError::UnsupportedEncryptionMode {
                    offered: vec![mode_name],
                };
                error!("[{}] {}", self.params.guild_id, e);
                return Some(SessionOutcome::Abort(e));
            }
        };

        let media = MediaSession {
            ssrc: self.ssrc,
            transport: SecureTransport::new(mode, &secret_key),
        };
        if let Err(e) = self.handoff.publish(media) {
            return Some(SessionOutcome::Reconnect(e.to_string()));
        }
        self.handoff.map_stream(self.ssrc, self.params.user_id);

        let link = ControlLink {
            tx: self.tx.clone(),
            ssrc: self.ssrc,
            user_id: self.params.user_id,
        };
        let speaking = self.client.speaking.load(Ordering::Acquire);
        link.send_speaking(speaking);
        *self.client.control.lock() = Some(link);

        self.set_state(ConnectionState::Connected);
        self.reached_connected = true;
        info!(
            "[{}] Voice connected (ssrc {}, mode {})",
            self.params.guild_id,
            self.ssrc,
            mode.as_str()
        );

        let _ = self.client.events.send(VoiceEvent::UserSpeaking {
            user_id: self.params.user_id,
            speaking,
        });
        None
    }

    fn handle_speaking(&mut self, user_id: Option<UserId>, ssrc: u32, speaking: bool) {
        let Some(user_id) = user_id else {
            return;
        };
        self.handoff.map_stream(ssrc, user_id);
        let _ = self
            .client
            .events
            .send(VoiceEvent::UserSpeaking { user_id, speaking });
    }

    fn start_heartbeat(&mut self, interval_ms: u64) {
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }

        debug!(
            "[{}] Heartbeat interval set to {}ms",
            self.params.guild_id, interval_ms
        );
        self.awaiting_ack.store(false, Ordering::Release);
        self.heartbeat_handle = Some(spawn_heartbeat(
            self.tx.clone(),
            Duration::from_millis(interval_ms.max(1)),
            self.awaiting_ack.clone(),
            self.faults_tx.clone(),
            self.cancel.clone(),
        ));
    }

    fn record_latency(&self, nonce: u64) {
        self.awaiting_ack.store(false, Ordering::Release);
        let now = now_ms();
        if nonce == 0 || nonce > now {
            return;
        }
        let latency = now - nonce;
        self.client.ping.store(latency as i64, Ordering::Relaxed);
        trace!("[{}] Heartbeat latency {}ms", self.params.guild_id, latency);
    }

    /// Stops the media side: cancel, wait for both loops, then let the
    /// socket go. The control channel is closed by the caller afterwards.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
        for handle in self.loops.drain(..) {
            handle.join().await;
        }
        self.channel = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!(
            "[{}] Voice state {:?} -> {:?}",
            self.params.guild_id, self.state, state
        );
        self.state = state;
        self.client.set_state(state);
    }

    fn send_message(&self, message: ControlMessage) {
        send_control(&self.tx, message);
    }
}

impl<'a> Drop for SessionState<'a> {
    fn drop(&mut self) {
        if self.reached_connected {
            *self.client.control.lock() = None;
        }
        self.cancel.cancel();
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
    }
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "relay host has no address"))
}
