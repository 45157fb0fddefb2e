pub mod audio;
pub mod common;
pub mod configs;
pub mod gateway;
pub mod protocol;

pub use gateway::VoiceClient;
pub use protocol::VoiceEvent;
