pub mod codec;
pub mod constants;
pub mod frame_buffer;

pub use codec::{AudioEncoder, EncoderFactory, OpusCodecEncoder, opus_encoder_factory};
pub use frame_buffer::FrameBuffer;
