pub mod constants;
pub mod discovery;
pub mod encryption;
pub mod packet;
pub mod scheduler;
pub mod session;
pub mod udp_link;

pub use encryption::{EncryptionMode, SecureTransport};
pub use packet::{RtpHeader, RtpSequencer};
pub use scheduler::ExecutionStrategy;
pub use session::{ConnectionState, SessionParams, VoiceClient};
pub use udp_link::{DatagramLink, MediaChannel};
