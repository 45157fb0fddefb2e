use serde::{Deserialize, Serialize};

use crate::{
    common::types::{ChannelId, GuildId, SessionId, UserId},
    gateway::SessionParams,
};

/// Credentials for the demo binary. A library caller builds
/// [`SessionParams`] from its own gateway events instead.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    pub endpoint: String,
}

impl From<SessionConfig> for SessionParams {
    fn from(c: SessionConfig) -> Self {
        Self {
            guild_id: c.guild_id,
            channel_id: c.channel_id,
            user_id: c.user_id,
            session_id: c.session_id,
            token: c.token,
            endpoint: c.endpoint,
        }
    }
}
