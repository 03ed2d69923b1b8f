pub mod events;
pub mod wire;

pub use events::{ChatEvent, TimedEvent};
pub use wire::{
    decode_chat_line, decode_frame, encode_chat_line, encode_frame, sanitize_field, DecodeReport,
    Frame, FrameError, LineFrameDecoder, DEFAULT_MAX_FRAME_BYTES,
};
