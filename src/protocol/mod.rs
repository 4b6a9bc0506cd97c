//! Protocol module - wire format, framing, and payload shapes.
//!
//! - 9-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - MsgPack payload bodies for requests, responses and notifications

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{ErrorPayload, NotificationPayload, Request, RequestRef};
pub use wire_format::{
    flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, NOTIFICATION_CALL_ID,
};
