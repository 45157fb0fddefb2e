use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

use crate::{
    audio::{AudioEncoder, FrameBuffer, constants::MAX_OPUS_FRAME_SIZE},
    common::types::{ChannelId, GuildId},
    gateway::{
        constants::{KEEPALIVE_PACKET_SIZE, MAX_IDLE_SLEEP_MS, UDP_PACKET_BUF_CAPACITY},
        discovery::{self, DiscoveredAddress},
        packet::RtpSequencer,
        scheduler::{LoopControl, MediaLoop},
        session::handoff::{MediaSession, SessionHandoff},
    },
    protocol::VoiceEvent,
};

const IDLE_SLEEP: Duration = Duration::from_millis(MAX_IDLE_SLEEP_MS);

/// Non-blocking datagram I/O, so both loop drivers can share one socket.
pub trait DatagramLink: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// `Ok(None)` when nothing is waiting.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

impl DatagramLink for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The datagram side of one session: a socket plus the relay endpoint it
/// talks to.
pub struct MediaChannel {
    link: Arc<dyn DatagramLink>,
    remote: SocketAddr,
}

impl MediaChannel {
    /// Binds an ephemeral non-blocking socket of the relay's address family.
    pub fn open(remote: SocketAddr) -> io::Result<Self> {
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self::with_link(Arc::new(socket), remote))
    }

    pub fn with_link(link: Arc<dyn DatagramLink>, remote: SocketAddr) -> Self {
        Self { link, remote }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send_probe(&self, ssrc: u32) -> io::Result<()> {
        self.link.send_to(&discovery::build_probe(ssrc), self.remote)?;
        Ok(())
    }

    pub fn send_loop(
        &self,
        guild_id: GuildId,
        buffer: Arc<FrameBuffer>,
        handoff: Arc<SessionHandoff>,
        encoder: Box<dyn AudioEncoder>,
        pacer: Pacer,
        samples_per_frame: u32,
    ) -> SendLoop {
        SendLoop {
            guild_id,
            link: self.link.clone(),
            remote: self.remote,
            pcm: vec![0u8; buffer.frame_size()],
            buffer,
            handoff,
            encoder,
            pacer,
            samples_per_frame,
            clock: None,
            sequencer: None,
            encoded: vec![0u8; MAX_OPUS_FRAME_SIZE],
            packet: Vec::with_capacity(UDP_PACKET_BUF_CAPACITY),
            staged: false,
            keepalive: [0u8; KEEPALIVE_PACKET_SIZE],
        }
    }

    pub fn receive_loop(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        handoff: Arc<SessionHandoff>,
        events: UnboundedSender<VoiceEvent>,
        discovery: flume::Sender<DiscoveredAddress>,
        udp_ping: Arc<AtomicI64>,
        receive_audio: bool,
    ) -> ReceiveLoop {
        ReceiveLoop {
            guild_id,
            channel_id,
            link: self.link.clone(),
            remote: self.remote,
            handoff,
            events,
            discovery,
            udp_ping,
            receive_audio,
            buf: vec![0u8; UDP_PACKET_BUF_CAPACITY],
        }
    }
}

/// Frame and keepalive deadlines on a monotonic timeline that starts at zero
/// when the session connects.
#[derive(Debug)]
pub struct Pacer {
    frame_interval: Duration,
    keepalive_interval: Duration,
    next_frame: Duration,
    next_keepalive: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerTick {
    pub frame_due: bool,
    pub keepalive_due: bool,
    /// How long the loop may sleep before checking again.
    pub wait: Duration,
}

impl Pacer {
    pub fn new(frame_interval: Duration, keepalive_interval: Duration) -> Self {
        Self {
            frame_interval,
            keepalive_interval,
            next_frame: Duration::ZERO,
            next_keepalive: Duration::ZERO,
        }
    }

    pub fn poll(&mut self, elapsed: Duration) -> PacerTick {
        if elapsed < self.next_frame {
            return PacerTick {
                frame_due: false,
                keepalive_due: false,
                wait: (self.next_frame - elapsed).min(IDLE_SLEEP),
            };
        }

        self.next_frame += self.frame_interval;
        let keepalive_due = elapsed >= self.next_keepalive;
        if keepalive_due {
            self.next_keepalive = elapsed + self.keepalive_interval;
        }

        PacerTick {
            frame_due: true,
            keepalive_due,
            wait: Duration::ZERO,
        }
    }
}

/// pop → encode → seal → stage, then transmit on the frame deadline.
pub struct SendLoop {
    guild_id: GuildId,
    link: Arc<dyn DatagramLink>,
    remote: SocketAddr,
    buffer: Arc<FrameBuffer>,
    handoff: Arc<SessionHandoff>,
    encoder: Box<dyn AudioEncoder>,
    pacer: Pacer,
    samples_per_frame: u32,
    clock: Option<Instant>,
    sequencer: Option<RtpSequencer>,
    pcm: Vec<u8>,
    encoded: Vec<u8>,
    packet: Vec<u8>,
    staged: bool,
    keepalive: [u8; KEEPALIVE_PACKET_SIZE],
}

impl SendLoop {
    fn stage_frame(&mut self, media: &MediaSession) {
        let spf = self.samples_per_frame;
        let header = self
            .sequencer
            .get_or_insert_with(|| RtpSequencer::new(media.ssrc, spf))
            .next_header();

        let size = match self.encoder.encode(&self.pcm, &mut self.encoded) {
            Ok(size) => size,
            Err(e) => {
                warn!("[{}] Encoding failure: {}", self.guild_id, e);
                return;
            }
        };

        if let Err(e) = media
            .transport
            .seal(&header, &self.encoded[..size], &mut self.packet)
        {
            warn!("[{}] Dropping frame {}: {}", self.guild_id, header.sequence, e);
            return;
        }
        self.staged = true;
    }

    fn transmit_staged(&mut self) {
        if let Err(e) = self.link.send_to(&self.packet, self.remote) {
            warn!("[{}] Failed to send voice packet: {}", self.guild_id, e);
        }
        self.staged = false;
    }

    fn send_keepalive(&mut self) {
        let counter = LittleEndian::read_u64(&self.keepalive).wrapping_add(1);
        LittleEndian::write_u64(&mut self.keepalive, counter);
        self.handoff.keepalives().record_sent(counter, Instant::now());
        if let Err(e) = self.link.send_to(&self.keepalive, self.remote) {
            warn!("[{}] Failed to send UDP keepalive: {}", self.guild_id, e);
        }
    }
}

impl MediaLoop for SendLoop {
    fn name(&self) -> &'static str {
        "send"
    }

    fn poll(&mut self) -> LoopControl {
        let handoff = Arc::clone(&self.handoff);
        let Some(media) = handoff.media() else {
            // Not connected yet; nothing may leave before the key exists.
            return LoopControl::Sleep(IDLE_SLEEP);
        };
        let started = *self.clock.get_or_insert_with(Instant::now);

        if !self.staged && self.buffer.pop(&mut self.pcm) {
            self.stage_frame(media);
        }

        let tick = self.pacer.poll(started.elapsed());
        if !tick.frame_due {
            return LoopControl::Sleep(tick.wait);
        }

        if self.staged {
            self.transmit_staged();
        }
        if tick.keepalive_due {
            self.send_keepalive();
        }
        LoopControl::Yield
    }
}

/// receive → (discovery | keepalive echo | open → look up → emit).
pub struct ReceiveLoop {
    guild_id: GuildId,
    channel_id: ChannelId,
    link: Arc<dyn DatagramLink>,
    remote: SocketAddr,
    handoff: Arc<SessionHandoff>,
    events: UnboundedSender<VoiceEvent>,
    discovery: flume::Sender<DiscoveredAddress>,
    udp_ping: Arc<AtomicI64>,
    receive_audio: bool,
    buf: Vec<u8>,
}

impl ReceiveLoop {
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> LoopControl {
        if from != self.remote {
            trace!("[{}] Ignoring datagram from {}", self.guild_id, from);
            return LoopControl::Yield;
        }

        let Some(media) = self.handoff.media() else {
            return self.handle_discovery(datagram);
        };

        if datagram.len() == KEEPALIVE_PACKET_SIZE {
            self.handle_keepalive_echo(datagram);
            return LoopControl::Yield;
        }

        let Some(packet) = media.transport.open(datagram) else {
            trace!(
                "[{}] Dropped undecodable datagram ({} bytes)",
                self.guild_id,
                datagram.len()
            );
            return LoopControl::Yield;
        };

        match self.handoff.user_for(packet.header.ssrc) {
            Some(user_id) => {
                let _ = self.events.send(VoiceEvent::PacketReceived {
                    user_id,
                    channel_id: self.channel_id,
                    buffer: packet.buffer,
                    offset: packet.offset,
                    length: packet.length,
                });
            }
            None => trace!(
                "[{}] Packet for unmapped SSRC {}",
                self.guild_id,
                packet.header.ssrc
            ),
        }
        LoopControl::Yield
    }

    fn handle_keepalive_echo(&self, datagram: &[u8]) {
        let counter = LittleEndian::read_u64(datagram);
        match self.handoff.keepalives().match_echo(counter, Instant::now()) {
            Some(rtt) => {
                let ms = rtt.as_millis() as i64;
                self.udp_ping.store(ms, Ordering::Relaxed);
                trace!("[{}] UDP round-trip {}ms", self.guild_id, ms);
            }
            None => trace!("[{}] Unexpected keepalive echo {}", self.guild_id, counter),
        }
    }

    fn handle_discovery(&self, datagram: &[u8]) -> LoopControl {
        let Some(found) = discovery::parse_response(datagram) else {
            trace!(
                "[{}] Ignoring {}-byte datagram before session key",
                self.guild_id,
                datagram.len()
            );
            return LoopControl::Yield;
        };

        debug!(
            "[{}] Discovered external address {}:{}",
            self.guild_id, found.address, found.port
        );
        let _ = self.discovery.send(found);

        if self.receive_audio {
            LoopControl::Yield
        } else {
            LoopControl::Exit
        }
    }
}

impl MediaLoop for ReceiveLoop {
    fn name(&self) -> &'static str {
        "recv"
    }

    fn poll(&mut self) -> LoopControl {
        match self.link.try_recv_from(&mut self.buf) {
            Ok(Some((len, from))) => {
                let buf = std::mem::take(&mut self.buf);
                let control = self.handle_datagram(&buf[..len], from);
                self.buf = buf;
                control
            }
            Ok(None) => LoopControl::Sleep(IDLE_SLEEP),
            Err(e) => {
                trace!("[{}] UDP receive error: {}", self.guild_id, e);
                LoopControl::Sleep(IDLE_SLEEP)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::types::{AnyResult, UserId},
        gateway::{
            encryption::{EncryptionMode, SecureTransport},
            packet::RtpHeader,
        },
    };
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    const KEY: [u8; 32] = [3u8; 32];

    fn remote() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl DatagramLink for RecordingLink {
        fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push(buf.to_vec());
            Ok(buf.len())
        }

        fn try_recv_from(&self, _buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }
    }

    struct CopyEncoder;

    impl AudioEncoder for CopyEncoder {
        fn encode(&mut self, pcm: &[u8], output: &mut [u8]) -> AnyResult<usize> {
            output[..pcm.len()].copy_from_slice(pcm);
            Ok(pcm.len())
        }
    }

    fn connected_handoff(ssrc: u32) -> Arc<SessionHandoff> {
        let handoff = Arc::new(SessionHandoff::new());
        handoff
            .publish(MediaSession {
                ssrc,
                transport: SecureTransport::new(EncryptionMode::XSalsa20Poly1305, &KEY),
            })
            .unwrap();
        handoff
    }

    fn receive_loop(
        handoff: Arc<SessionHandoff>,
        receive_audio: bool,
    ) -> (
        ReceiveLoop,
        tokio::sync::mpsc::UnboundedReceiver<VoiceEvent>,
        flume::Receiver<DiscoveredAddress>,
    ) {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (disc_tx, disc_rx) = flume::unbounded();
        let channel = MediaChannel::with_link(Arc::new(RecordingLink::default()), remote());
        let rl = channel.receive_loop(
            GuildId("g".into()),
            ChannelId(77),
            handoff,
            events_tx,
            disc_tx,
            Arc::new(AtomicI64::new(-1)),
            receive_audio,
        );
        (rl, events_rx, disc_rx)
    }

    fn sealed(sequence: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let transport = SecureTransport::new(EncryptionMode::XSalsa20Poly1305, &KEY);
        let mut out = Vec::new();
        transport
            .seal(
                &RtpHeader {
                    sequence,
                    timestamp: sequence as u32 * 960,
                    ssrc,
                },
                payload,
                &mut out,
            )
            .unwrap();
        out
    }

    #[test]
    fn pacer_releases_one_frame_per_interval() {
        let mut pacer = Pacer::new(Duration::from_millis(20), Duration::from_secs(5));

        let first = pacer.poll(Duration::ZERO);
        assert!(first.frame_due && first.keepalive_due);

        let early = pacer.poll(Duration::from_millis(5));
        assert!(!early.frame_due);
        assert!(early.wait <= IDLE_SLEEP);

        let second = pacer.poll(Duration::from_millis(20));
        assert!(second.frame_due && !second.keepalive_due);

        assert!(!pacer.poll(Duration::from_millis(39)).frame_due);
        assert!(pacer.poll(Duration::from_millis(40)).frame_due);
        assert!(pacer.poll(Duration::from_millis(5_001)).keepalive_due);
    }

    #[test]
    fn send_loop_waits_for_session_key() {
        let link = Arc::new(RecordingLink::default());
        let buffer = Arc::new(FrameBuffer::new(4, 8));
        buffer.push(&[1u8; 8], &CancellationToken::new()).unwrap();

        let channel = MediaChannel::with_link(link.clone(), remote());
        let mut send = channel.send_loop(
            GuildId("g".into()),
            buffer.clone(),
            Arc::new(SessionHandoff::new()),
            Box::new(CopyEncoder),
            Pacer::new(Duration::from_millis(20), Duration::from_secs(5)),
            960,
        );

        assert_eq!(send.poll(), LoopControl::Sleep(IDLE_SLEEP));
        assert!(link.sent.lock().is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn send_loop_transmits_sealed_frames_in_sequence() {
        let link = Arc::new(RecordingLink::default());
        let buffer = Arc::new(FrameBuffer::new(4, 8));
        let cancel = CancellationToken::new();
        buffer.push(&[1u8; 8], &cancel).unwrap();
        buffer.push(&[2u8; 8], &cancel).unwrap();

        let handoff = connected_handoff(1234);
        let channel = MediaChannel::with_link(link.clone(), remote());
        let mut send = channel.send_loop(
            GuildId("g".into()),
            buffer,
            handoff.clone(),
            Box::new(CopyEncoder),
            Pacer::new(Duration::from_millis(1), Duration::from_secs(60)),
            960,
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let media_packets = link
                .sent
                .lock()
                .iter()
                .filter(|p| p.len() != KEEPALIVE_PACKET_SIZE)
                .count();
            if media_packets == 2 {
                break;
            }
            if let LoopControl::Sleep(d) = send.poll() {
                std::thread::sleep(d);
            }
        }

        let sent = link.sent.lock();
        assert_eq!(sent[0].len(), KEEPALIVE_PACKET_SIZE);
        assert_eq!(LittleEndian::read_u64(&sent[0]), 1);
        assert!(handoff.keepalives().match_echo(1, Instant::now()).is_some());

        let transport = &handoff.media().unwrap().transport;
        let media: Vec<_> = sent
            .iter()
            .filter(|p| p.len() != KEEPALIVE_PACKET_SIZE)
            .map(|p| transport.open(p).unwrap())
            .collect();
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].header.sequence, 0);
        assert_eq!(media[1].header.sequence, 1);
        assert_eq!(media[1].header.timestamp, 960);
        assert_eq!(media[0].header.ssrc, 1234);
        assert_eq!(media[0].payload(), &[1u8; 8]);
        assert_eq!(media[1].payload(), &[2u8; 8]);
    }

    #[test]
    fn discovery_response_is_forwarded_before_connect() {
        let (rl, _events, disc_rx) = receive_loop(Arc::new(SessionHandoff::new()), true);
        let response = discovery::encode_response(1234, "198.51.100.4", 40_000);

        assert_eq!(rl.handle_datagram(&response, remote()), LoopControl::Yield);
        assert_eq!(
            disc_rx.try_recv().unwrap(),
            DiscoveredAddress {
                address: "198.51.100.4".into(),
                port: 40_000
            }
        );
    }

    #[test]
    fn outgoing_only_receive_loop_exits_after_discovery() {
        let (rl, _events, disc_rx) = receive_loop(Arc::new(SessionHandoff::new()), false);
        let response = discovery::encode_response(1, "10.1.1.1", 1);
        assert_eq!(rl.handle_datagram(&response, remote()), LoopControl::Exit);
        assert!(disc_rx.try_recv().is_ok());
    }

    #[test]
    fn foreign_and_malformed_datagrams_are_dropped_silently() {
        let handoff = connected_handoff(1);
        handoff.map_stream(9, UserId(900));
        let (rl, mut events, _disc) = receive_loop(handoff.clone(), true);

        let valid = sealed(0, 9, b"hello");
        let stranger: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        assert_eq!(rl.handle_datagram(&valid, stranger), LoopControl::Yield);
        assert_eq!(rl.handle_datagram(&[0x80, 0x78, 0, 1], remote()), LoopControl::Yield);

        let mut wrong_type = valid.clone();
        wrong_type[1] = 0x00;
        assert_eq!(rl.handle_datagram(&wrong_type, remote()), LoopControl::Yield);

        assert!(events.try_recv().is_err());
        assert_eq!(handoff.known_streams(), 1);
        assert_eq!(handoff.user_for(9), Some(UserId(900)));
    }

    #[test]
    fn echoed_keepalive_sets_udp_ping_and_is_not_media() {
        let handoff = connected_handoff(1);
        let (rl, mut events, _disc) = receive_loop(handoff.clone(), true);

        let sent_at = Instant::now() - Duration::from_millis(30);
        handoff.keepalives().record_sent(7, sent_at);

        let mut echo = [0u8; KEEPALIVE_PACKET_SIZE];
        LittleEndian::write_u64(&mut echo, 99);
        assert_eq!(rl.handle_datagram(&echo, remote()), LoopControl::Yield);
        assert_eq!(rl.udp_ping.load(Ordering::Relaxed), -1);

        LittleEndian::write_u64(&mut echo, 7);
        assert_eq!(rl.handle_datagram(&echo, remote()), LoopControl::Yield);
        let ping = rl.udp_ping.load(Ordering::Relaxed);
        assert!((30..1_000).contains(&ping), "udp ping was {}", ping);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn tampered_packet_is_dropped_and_next_one_decrypts() {
        let handoff = connected_handoff(1);
        handoff.map_stream(9, UserId(900));
        let (rl, mut events, _disc) = receive_loop(handoff, true);

        let mut tampered = sealed(0, 9, b"first");
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        rl.handle_datagram(&tampered, remote());
        rl.handle_datagram(&sealed(1, 9, b"second"), remote());

        let event = events.try_recv().unwrap();
        assert_eq!(event.payload(), Some(&b"second"[..]));
        match event {
            VoiceEvent::PacketReceived {
                user_id, channel_id, ..
            } => {
                assert_eq!(user_id, UserId(900));
                assert_eq!(channel_id, ChannelId(77));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }
}
