use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    common::{
        errors::VoiceError,
        types::{ChannelId, GuildId, SessionId, UserId},
    },
    gateway::constants::VOICE_GATEWAY_VERSION,
};

#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const HELLO: u8 = 8;
}

/// Every control message this client understands, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Identify {
        server_id: GuildId,
        user_id: UserId,
        session_id: SessionId,
        token: String,
    },
    SelectProtocol {
        address: String,
        port: u16,
        mode: String,
    },
    Ready {
        ssrc: u32,
        port: u16,
        modes: Vec<String>,
        heartbeat_interval: Option<u64>,
        /// Relay address; older servers leave it out and expect the client
        /// to use the endpoint host.
        ip: Option<String>,
    },
    Heartbeat {
        nonce: u64,
    },
    SessionKey {
        secret_key: [u8; 32],
        mode: String,
    },
    Speaking {
        user_id: Option<UserId>,
        ssrc: u32,
        speaking: bool,
        delay: u32,
    },
    Hello {
        heartbeat_interval: u64,
    },
    HeartbeatAck {
        nonce: u64,
    },
    Unknown {
        op: u8,
    },
}

#[derive(Deserialize)]
struct IdentifyPayload {
    server_id: GuildId,
    user_id: UserId,
    session_id: SessionId,
    token: String,
}

#[derive(Deserialize)]
struct SelectProtocolPayload {
    data: SelectProtocolData,
}

#[derive(Deserialize)]
struct SelectProtocolData {
    address: String,
    port: u16,
    mode: String,
}

#[derive(Deserialize)]
struct ReadyPayload {
    ssrc: u32,
    port: u16,
    #[serde(default)]
    modes: Vec<String>,
    #[serde(default)]
    heartbeat_interval: Option<f64>,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Deserialize)]
struct SessionKeyPayload {
    secret_key: Vec<u8>,
    mode: String,
}

#[derive(Deserialize)]
struct SpeakingPayload {
    #[serde(default)]
    user_id: Option<UserId>,
    ssrc: u32,
    speaking: SpeakingFlag,
    #[serde(default)]
    delay: u32,
}

/// Servers send either a boolean or a bitmask.
#[derive(Deserialize)]
#[serde(untagged)]
enum SpeakingFlag {
    Flag(bool),
    Bits(u64),
}

impl SpeakingFlag {
    fn is_speaking(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Bits(bits) => *bits != 0,
        }
    }
}

#[derive(Deserialize)]
struct HelloPayload {
    heartbeat_interval: f64,
}

/// A bare integer, or an object carrying it.
#[derive(Deserialize)]
#[serde(untagged)]
enum NoncePayload {
    Bare(u64),
    Wrapped {
        #[serde(alias = "t")]
        nonce: u64,
    },
}

impl NoncePayload {
    fn value(&self) -> u64 {
        match self {
            Self::Bare(nonce) | Self::Wrapped { nonce } => *nonce,
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, d: Value) -> Result<T, VoiceError> {
    serde_json::from_value(d).map_err(|e| VoiceError::Protocol(format!("{}: {}", kind, e)))
}

impl ControlMessage {
    /// Fails only when a known kind carries a payload of the wrong shape;
    /// unknown kinds come back as [`ControlMessage::Unknown`].
    pub fn from_raw(raw: VoiceGatewayMessage) -> Result<Self, VoiceError> {
        let VoiceGatewayMessage { op, d } = raw;
        let message = match op {
            op::IDENTIFY => {
                let p: IdentifyPayload = payload("identify", d)?;
                Self::Identify {
                    server_id: p.server_id,
                    user_id: p.user_id,
                    session_id: p.session_id,
                    token: p.token,
                }
            }
            op::SELECT_PROTOCOL => {
                let p: SelectProtocolPayload = payload("select_protocol", d)?;
                Self::SelectProtocol {
                    address: p.data.address,
                    port: p.data.port,
                    mode: p.data.mode,
                }
            }
            op::READY => {
                let p: ReadyPayload = payload("ready", d)?;
                Self::Ready {
                    ssrc: p.ssrc,
                    port: p.port,
                    modes: p.modes,
                    heartbeat_interval: p.heartbeat_interval.map(|ms| ms as u64),
                    ip: p.ip.filter(|ip| !ip.is_empty()),
                }
            }
            op::HEARTBEAT => Self::Heartbeat {
                nonce: payload::<NoncePayload>("heartbeat", d)?.value(),
            },
            op::SESSION_DESCRIPTION => {
                let p: SessionKeyPayload = payload("session_description", d)?;
                let len = p.secret_key.len();
                let secret_key: [u8; 32] = p.secret_key.try_into().map_err(|_| {
                    VoiceError::Protocol(format!("secret_key must be 32 bytes, got {}", len))
                })?;
                Self::SessionKey {
                    secret_key,
                    mode: p.mode,
                }
            }
            op::SPEAKING => {
                let p: SpeakingPayload = payload("speaking", d)?;
                Self::Speaking {
                    user_id: p.user_id,
                    ssrc: p.ssrc,
                    speaking: p.speaking.is_speaking(),
                    delay: p.delay,
                }
            }
            op::HEARTBEAT_ACK => Self::HeartbeatAck {
                nonce: payload::<NoncePayload>("heartbeat_ack", d)?.value(),
            },
            op::HELLO => {
                let p: HelloPayload = payload("hello", d)?;
                Self::Hello {
                    heartbeat_interval: p.heartbeat_interval as u64,
                }
            }
            other => Self::Unknown { op: other },
        };
        Ok(message)
    }

    pub fn into_raw(self) -> VoiceGatewayMessage {
        let (op, d) = match self {
            Self::Identify {
                server_id,
                user_id,
                session_id,
                token,
            } => (
                op::IDENTIFY,
                json!({
                    "server_id": server_id,
                    "user_id": user_id,
                    "session_id": session_id,
                    "token": token,
                }),
            ),
            Self::SelectProtocol {
                address,
                port,
                mode,
            } => (
                op::SELECT_PROTOCOL,
                json!({
                    "protocol": "udp",
                    "data": { "address": address, "port": port, "mode": mode },
                }),
            ),
            Self::Ready {
                ssrc,
                port,
                modes,
                heartbeat_interval,
                ip,
            } => (
                op::READY,
                json!({
                    "ssrc": ssrc,
                    "port": port,
                    "modes": modes,
                    "heartbeat_interval": heartbeat_interval,
                    "ip": ip,
                }),
            ),
            Self::Heartbeat { nonce } => (op::HEARTBEAT, json!(nonce)),
            Self::SessionKey { secret_key, mode } => (
                op::SESSION_DESCRIPTION,
                json!({ "secret_key": secret_key, "mode": mode }),
            ),
            // Outbound speaking goes out as the integer flag.
            Self::Speaking {
                user_id,
                ssrc,
                speaking,
                delay,
            } => {
                let mut d = json!({
                    "ssrc": ssrc,
                    "speaking": u8::from(speaking),
                    "delay": delay,
                });
                if let Some(user_id) = user_id {
                    d["user_id"] = json!(user_id);
                }
                (op::SPEAKING, d)
            }
            Self::Hello { heartbeat_interval } => (
                op::HELLO,
                json!({ "heartbeat_interval": heartbeat_interval }),
            ),
            Self::HeartbeatAck { nonce } => (op::HEARTBEAT_ACK, json!(nonce)),
            Self::Unknown { op } => (op, Value::Null),
        };
        VoiceGatewayMessage { op, d }
    }
}

/// Control-channel progress, as observed through [`super::VoiceClient::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket opening, Identify about to go out.
    Connecting,
    AwaitingReady,
    /// Stream id and relay known, discovery probe sent.
    Ready,
    AwaitingSessionKey,
    Connected,
}

/// Outcome of a single WS session; tells the outer loop what to do next.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Local cancellation. Silent.
    Shutdown,
    /// The server ended the session on purpose; credentials are spent.
    Closed(String),
    /// Unexpected drop; retry with the same credentials.
    Reconnect(String),
    /// Retrying cannot succeed.
    Abort(VoiceError),
}

/// Credentials and routing for one voice session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    /// Relay host as handed out by the main gateway, usually `host:port`.
    /// A `ws://` or `wss://` URL is used as-is.
    pub endpoint: String,
}

impl SessionParams {
    pub fn gateway_url(&self) -> String {
        let base = if self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://") {
            self.endpoint.trim_end_matches('/').to_string()
        } else {
            format!("wss://{}", self.relay_host())
        };
        format!("{}/?v={}", base, VOICE_GATEWAY_VERSION)
    }

    /// The endpoint host with scheme, path and port stripped.
    pub fn relay_host(&self) -> &str {
        let host = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        let host = host.split('/').next().unwrap_or(host);
        match host.rsplit_once(':') {
            Some((name, port)) if port.parse::<u16>().is_ok() && !name.is_empty() => name,
            _ => host,
        }
    }

    pub fn identify(&self) -> ControlMessage {
        ControlMessage::Identify {
            server_id: self.guild_id.clone(),
            user_id: self.user_id,
            session_id: self.session_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Close codes after which the same credentials will never work again.
///
/// - `4004`: Authentication failed
/// - `4014`: Disconnected by the server (kicked or channel deleted)
pub fn is_intentional_close(code: u16) -> bool {
    matches!(code, 4004 | 4014)
}
