pub mod decoder;
pub mod encoder;
pub mod types;

pub use decoder::{FrameDecodeState, FrameDecoder};
pub use encoder::FrameEncoder;
pub use types::{Frame, DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN, TAG_LENGTH_FIELD_LEN};
