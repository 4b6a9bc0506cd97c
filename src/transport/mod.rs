//! Transport module - the channel between client and backend.
//!
//! - Unix Domain Sockets (Linux/macOS) or Named Pipes (Windows)
//! - [`FrameReader`] for the read side, owned by the dispatcher
//! - the write side lives in [`crate::writer`]

mod pipe;
mod reader;

pub use pipe::{
    generate_endpoint_path, PipeCleanup, PipeListener, PipeReadHalf, PipeStream, PipeWriteHalf,
};
pub use reader::FrameReader;
