use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot, watch,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{EncoderFactory, FrameBuffer, opus_encoder_factory},
    common::errors::VoiceError,
    configs::VoiceConfig,
    gateway::constants::WRITE_TASK_SHUTDOWN_MS,
    protocol::VoiceEvent,
};

pub mod backoff;
pub mod handler;
pub mod handoff;
pub mod heartbeat;
pub mod types;

pub use self::types::{ConnectionState, SessionParams};

use self::{
    backoff::Backoff,
    handler::{ControlLink, SessionState, wait_discovery},
    types::{SessionOutcome, is_intentional_close},
};

/// Handle to one voice connection. Cheap to clone; every clone drives the
/// same session.
///
/// ```no_run
/// # async fn demo(params: voicelink::gateway::SessionParams) -> Result<(), voicelink::common::VoiceError> {
/// let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
/// let client = voicelink::VoiceClient::new(Default::default(), events_tx);
/// client.connect(params).await?;
/// client.push_pcm(&[0u8; 3840])?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct VoiceClient {
    inner: Arc<ClientInner>,
}

struct SupervisorHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Shared by the caller-facing handle, the supervisor task and, by
/// reference, each [`SessionState`].
pub(crate) struct ClientInner {
    config: VoiceConfig,
    buffer: Arc<FrameBuffer>,
    encoder_factory: EncoderFactory,
    events: UnboundedSender<VoiceEvent>,
    state_tx: watch::Sender<ConnectionState>,
    /// Last heartbeat round-trip in ms, `-1` until the first echo.
    ping: AtomicI64,
    /// Last keepalive round-trip over UDP in ms, `-1` until the first echo.
    udp_ping: Arc<AtomicI64>,
    /// Speaking flag announced on every handshake and by `set_speaking`.
    speaking: AtomicBool,
    control: Mutex<Option<ControlLink>>,
    params: Mutex<Option<SessionParams>>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    /// Tail of the last `push_pcm` call that did not fill a whole frame.
    pending_pcm: Mutex<Vec<u8>>,
}

impl ClientInner {
    fn new(
        config: VoiceConfig,
        events: UnboundedSender<VoiceEvent>,
        encoder_factory: EncoderFactory,
    ) -> Self {
        let buffer = Arc::new(FrameBuffer::new(
            config.buffer_capacity(),
            config.frame_size_bytes(),
        ));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            pending_pcm: Mutex::new(Vec::with_capacity(buffer.frame_size())),
            config,
            buffer,
            encoder_factory,
            events,
            state_tx,
            ping: AtomicI64::new(-1),
            udp_ping: Arc::new(AtomicI64::new(-1)),
            speaking: AtomicBool::new(true),
            control: Mutex::new(None),
            params: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit_lost(&self, reason: String) {
        let _ = self.events.send(VoiceEvent::ConnectionLost { reason });
    }

    /// Reconnect loop. Exits on cancellation or on anything retrying cannot
    /// fix, clearing the stored credentials on the way out.
    async fn run(
        self: Arc<Self>,
        params: SessionParams,
        cancel: CancellationToken,
        fatal_tx: oneshot::Sender<VoiceError>,
    ) {
        let mut backoff = Backoff::new(
            self.config.reconnect_delay(),
            self.config.failed_reconnect_delay(),
        );

        loop {
            let (outcome, reached_connected) = self.connect_once(&params, &cancel).await;
            self.set_state(ConnectionState::Disconnected);
            if reached_connected {
                backoff.reset();
            }

            match outcome {
                SessionOutcome::Shutdown => {
                    debug!("[{}] Voice session shutting down cleanly", params.guild_id);
                    break;
                }
                SessionOutcome::Closed(reason) => {
                    info!("[{}] Voice session closed by server: {}", params.guild_id, reason);
                    self.emit_lost(reason.clone());
                    let _ = fatal_tx.send(VoiceError::Protocol(format!(
                        "voice server closed the session: {}",
                        reason
                    )));
                    break;
                }
                SessionOutcome::Abort(e) => {
                    error!("[{}] Fatal voice error: {}", params.guild_id, e);
                    self.emit_lost(e.to_string());
                    let _ = fatal_tx.send(e);
                    break;
                }
                SessionOutcome::Reconnect(reason) => {
                    if reached_connected {
                        self.emit_lost(reason.clone());
                    }
                    let delay = backoff.next();
                    warn!(
                        "[{}] Voice connection lost: {}. Reconnecting in {:?}",
                        params.guild_id, reason, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        *self.params.lock() = None;
        self.ping.store(-1, Ordering::Relaxed);
        self.udp_ping.store(-1, Ordering::Relaxed);
        cancel.cancel();
    }

    /// One websocket lifetime. The flag reports whether the session reached
    /// `Connected` before it ended.
    async fn connect_once(
        &self,
        params: &SessionParams,
        cancel: &CancellationToken,
    ) -> (SessionOutcome, bool) {
        self.set_state(ConnectionState::Connecting);
        let url = params.gateway_url();
        debug!("[{}] Connecting to voice gateway: {}", params.guild_id, url);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return (SessionOutcome::Shutdown, false),
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };
        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                return (
                    SessionOutcome::Reconnect(format!("gateway connect failed: {}", e)),
                    false,
                );
            }
        };
        let (write, mut read) = ws_stream.split();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let mut write_task = spawn_writer(write, rx);
        let mut writer_done = false;

        let mut state = SessionState::new(self, params, tx, cancel.child_token());
        let faults = state.faults();
        state.identify();

        let outcome = loop {
            let pending = state.pending_discovery();
            tokio::select! {
                _ = cancel.cancelled() => {
                    break SessionOutcome::Shutdown;
                }
                written = &mut write_task => {
                    writer_done = true;
                    let reason = match written {
                        Ok(Err(e)) => format!("WS write error: {}", e),
                        Ok(Ok(())) => "WS writer stopped".to_string(),
                        Err(e) => format!("WS writer failed: {}", e),
                    };
                    warn!("[{}] {}", params.guild_id, reason);
                    break SessionOutcome::Reconnect(reason);
                }
                Ok(reason) = faults.recv_async() => {
                    warn!("[{}] {}", params.guild_id, reason);
                    break SessionOutcome::Reconnect(reason);
                }
                found = wait_discovery(pending) => {
                    match found {
                        Some(found) => state.handle_discovery(found),
                        None => break SessionOutcome::Reconnect("IP discovery timed out".into()),
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] WS read error: {}", params.guild_id, e);
                            break SessionOutcome::Reconnect(format!("IO error: {}", e));
                        }
                        None => {
                            debug!("[{}] WS stream ended", params.guild_id);
                            break SessionOutcome::Reconnect("stream ended".into());
                        }
                    };

                    match msg {
                        Message::Text(text) => {
                            if let Some(outcome) = state.handle_text(&text).await {
                                break outcome;
                            }
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                .unwrap_or((1000u16, "No reason".into()));

                            info!(
                                "[{}] WS closed: code={}, reason='{}'",
                                params.guild_id, code, reason
                            );

                            let description = format!("closed with code {}: {}", code, reason);
                            if is_intentional_close(code) {
                                break SessionOutcome::Closed(description);
                            }
                            break SessionOutcome::Reconnect(description);
                        }
                        _ => {}
                    }
                }
            }
        };

        let reached_connected = state.reached_connected();
        state.shutdown().await;

        if !writer_done
            && tokio::time::timeout(Duration::from_millis(WRITE_TASK_SHUTDOWN_MS), &mut write_task)
                .await
                .is_err()
        {
            write_task.abort();
        }

        (outcome, reached_connected)
    }
}

/// Forwards queued control messages to the websocket until every sender is
/// gone, so it outlives the media loops. Finishing early with an error means
/// the socket is dead.
fn spawn_writer<S>(
    mut sink: S,
    mut rx: UnboundedReceiver<Message>,
) -> tokio::task::JoinHandle<Result<(), String>>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            sink.send(msg).await.map_err(|e| e.to_string())?;
        }
        let _ = sink.close().await;
        Ok(())
    })
}

impl VoiceClient {
    /// A client that encodes with Opus.
    pub fn new(config: VoiceConfig, events: UnboundedSender<VoiceEvent>) -> Self {
        Self::with_encoder(config, events, opus_encoder_factory())
    }

    pub fn with_encoder(
        config: VoiceConfig,
        events: UnboundedSender<VoiceEvent>,
        encoder_factory: EncoderFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner::new(config, events, encoder_factory)),
        }
    }

    /// Starts the supervisor and waits until the session is `Connected`.
    ///
    /// Any previous session is torn down first. On timeout the attempt is
    /// abandoned and the credentials are dropped.
    pub async fn connect(&self, params: SessionParams) -> Result<(), VoiceError> {
        self.disconnect().await;

        let cancel = CancellationToken::new();
        let (fatal_tx, mut fatal_rx) = oneshot::channel();
        let mut state_rx = self.inner.state_tx.subscribe();

        *self.inner.params.lock() = Some(params.clone());
        self.inner.speaking.store(true, Ordering::Release);
        let task = tokio::spawn(
            self.inner
                .clone()
                .run(params, cancel.clone(), fatal_tx),
        );
        *self.inner.supervisor.lock() = Some(SupervisorHandle {
            cancel: cancel.clone(),
            task,
        });

        let result = tokio::select! {
            connected = state_rx.wait_for(|s| *s == ConnectionState::Connected) => {
                connected.map(|_| ()).map_err(|_| VoiceError::Cancelled)
            }
            Ok(e) = &mut fatal_rx => Err(e),
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            _ = tokio::time::sleep(self.inner.config.connection_timeout()) => Err(VoiceError::Timeout),
        };

        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    /// Queues raw 48 kHz interleaved 16-bit LE PCM of any length. Whole
    /// frames go to the send buffer; a trailing partial frame waits for the
    /// next call. Blocks while the buffer is full. A `clear` from another
    /// thread drops whatever this call has not queued yet.
    pub fn push_pcm(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        let cancel = self.session_token()?;
        let buffer = &self.inner.buffer;
        let frame_size = buffer.frame_size();
        let generation = buffer.generation();
        let mut input = pcm;

        let head = {
            let mut pending = self.inner.pending_pcm.lock();
            if pending.is_empty() {
                None
            } else {
                let take = (frame_size - pending.len()).min(input.len());
                pending.extend_from_slice(&input[..take]);
                input = &input[take..];
                if pending.len() < frame_size {
                    return Ok(());
                }
                Some(std::mem::replace(
                    &mut *pending,
                    Vec::with_capacity(frame_size),
                ))
            }
        };

        if let Some(head) = head {
            if !buffer.push_unless_cleared(&head, generation, &cancel)? {
                return Ok(());
            }
        }

        let mut frames = input.chunks_exact(frame_size);
        for frame in &mut frames {
            if !buffer.push_unless_cleared(frame, generation, &cancel)? {
                return Ok(());
            }
        }

        let remainder = frames.remainder();
        if !remainder.is_empty() {
            let mut pending = self.inner.pending_pcm.lock();
            if buffer.generation() == generation {
                pending.extend_from_slice(remainder);
            }
        }
        Ok(())
    }

    /// Drops everything queued but not yet sent, including frames a
    /// concurrent `push_pcm` is still waiting to queue.
    pub fn clear(&self) {
        self.inner.buffer.clear();
        self.inner.pending_pcm.lock().clear();
    }

    /// Blocks until every queued frame has been sent. Call from a blocking
    /// context.
    pub fn wait(&self) -> Result<(), VoiceError> {
        let cancel = self.session_token()?;
        self.inner.buffer.drain(&cancel)
    }

    /// Intentional teardown: stops the supervisor, waits for every loop to
    /// exit and forgets the session credentials.
    pub async fn disconnect(&self) {
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!("Voice supervisor terminated abnormally: {}", e);
            }
        }
        *self.inner.params.lock() = None;
        self.clear();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Heartbeat round-trip, once the server has echoed one.
    pub fn ping(&self) -> Option<Duration> {
        let ms = self.inner.ping.load(Ordering::Relaxed);
        (ms >= 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Keepalive round-trip to the media relay, once it has echoed one.
    pub fn udp_ping(&self) -> Option<Duration> {
        let ms = self.inner.udp_ping.load(Ordering::Relaxed);
        (ms >= 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Announces whether this client is transmitting. Only a change is sent;
    /// while reconnecting the flag is kept and announced on the next
    /// handshake.
    pub fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError> {
        self.session_token()?;
        if self.inner.speaking.swap(speaking, Ordering::AcqRel) == speaking {
            return Ok(());
        }

        let control = self.inner.control.lock();
        if let Some(link) = control.as_ref() {
            link.send_speaking(speaking);
            let _ = self.inner.events.send(VoiceEvent::UserSpeaking {
                user_id: link.user_id(),
                speaking,
            });
        }
        Ok(())
    }

    /// Credentials of the current session. Kept across unexpected drops,
    /// cleared by any intentional disconnect.
    pub fn session(&self) -> Option<SessionParams> {
        self.inner.params.lock().clone()
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.inner.config
    }

    fn session_token(&self) -> Result<CancellationToken, VoiceError> {
        self.inner
            .supervisor
            .lock()
            .as_ref()
            .filter(|s| !s.cancel.is_cancelled())
            .map(|s| s.cancel.clone())
            .ok_or(VoiceError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::AudioEncoder,
        common::types::{AnyResult, ChannelId, GuildId, SessionId, UserId},
    };

    struct NullEncoder;

    impl AudioEncoder for NullEncoder {
        fn encode(&mut self, _pcm: &[u8], _output: &mut [u8]) -> AnyResult<usize> {
            Ok(0)
        }
    }

    fn client(config: VoiceConfig) -> (VoiceClient, tokio::sync::mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let factory: EncoderFactory =
            Arc::new(|_: &VoiceConfig| Ok(Box::new(NullEncoder) as Box<dyn AudioEncoder>));
        (VoiceClient::with_encoder(config, tx, factory), rx)
    }

    fn unreachable_params() -> SessionParams {
        SessionParams {
            guild_id: GuildId("1".into()),
            channel_id: ChannelId(2),
            user_id: UserId(3),
            session_id: SessionId("s".into()),
            token: "t".into(),
            // Nothing listens on the discard port; every attempt fails fast.
            endpoint: "ws://127.0.0.1:9".into(),
        }
    }

    #[test]
    fn push_requires_a_session() {
        let (client, _events) = client(VoiceConfig::default());
        assert!(matches!(
            client.push_pcm(&[0u8; 3840]),
            Err(VoiceError::NotConnected)
        ));
        assert!(matches!(
            client.set_speaking(false),
            Err(VoiceError::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.ping().is_none());
        assert!(client.udp_ping().is_none());
    }

    #[tokio::test]
    async fn connect_times_out_and_forgets_credentials() {
        let config = VoiceConfig {
            connection_timeout_ms: 300,
            reconnect_delay_ms: 20,
            failed_reconnect_delay_ms: 20,
            ..VoiceConfig::default()
        };
        let (client, _events) = client(config);

        let result = client.connect(unreachable_params()).await;
        assert!(matches!(result, Err(VoiceError::Timeout)));
        assert!(client.session().is_none());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.push_pcm(&[0u8; 4]),
            Err(VoiceError::NotConnected)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn credentials_survive_failed_attempts_until_disconnect() {
        let config = VoiceConfig {
            connection_timeout_ms: 60_000,
            reconnect_delay_ms: 10,
            failed_reconnect_delay_ms: 10,
            ..VoiceConfig::default()
        };
        let (client, _events) = client(config);

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(unreachable_params()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.session(), Some(unreachable_params()));

        // Partial frames are carried over; whole frames land in the buffer.
        let frame = client.config().frame_size_bytes();
        client.push_pcm(&vec![0u8; frame + 10]).unwrap();
        client.push_pcm(&vec![0u8; frame - 10]).unwrap();
        assert_eq!(client.inner.buffer.len(), 2);

        client.disconnect().await;
        assert!(client.session().is_none());
        assert!(client.inner.buffer.is_empty());
        assert!(matches!(
            connecting.await.unwrap(),
            Err(VoiceError::Cancelled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_interrupts_a_producer_blocked_on_a_full_buffer() {
        let config = VoiceConfig {
            buffer_length_ms: 40,
            connection_timeout_ms: 60_000,
            reconnect_delay_ms: 10,
            failed_reconnect_delay_ms: 10,
            ..VoiceConfig::default()
        };
        let (client, _events) = client(config);
        assert_eq!(client.inner.buffer.capacity(), 2);

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(unreachable_params()).await })
        };
        while client.session().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Nothing drains the buffer while the supervisor keeps failing.
        let frame = client.config().frame_size_bytes();
        let producer = {
            let client = client.clone();
            std::thread::spawn(move || client.push_pcm(&vec![1u8; frame * 6 + 10]))
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.inner.buffer.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("producer never filled the buffer");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        client.clear();
        assert!(started.elapsed() < Duration::from_millis(500));

        let pushed = tokio::task::spawn_blocking(move || producer.join())
            .await
            .unwrap()
            .unwrap();
        assert!(pushed.is_ok());
        assert!(client.inner.buffer.is_empty());
        assert!(client.inner.pending_pcm.lock().is_empty());

        client.disconnect().await;
        assert!(matches!(
            connecting.await.unwrap(),
            Err(VoiceError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn writer_reports_a_dead_socket() {
        let sink = Box::pin(futures::sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>("broken pipe".to_string())
        }));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = spawn_writer(sink, rx);

        tx.send(Message::Text("{}".into())).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer kept running")
            .unwrap();
        assert_eq!(result, Err("broken pipe".to_string()));
        // The session still holds its sender; the writer ended on its own.
        drop(tx);
    }

    #[tokio::test]
    async fn writer_finishes_cleanly_once_senders_are_gone() {
        let (sink_tx, mut sink_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = spawn_writer(sink_tx, rx);

        tx.send(Message::Text("{}".into())).unwrap();
        drop(tx);
        assert_eq!(writer.await.unwrap(), Ok(()));
        assert!(matches!(sink_rx.next().await, Some(Message::Text(_))));
    }
}
