//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use flow_client::protocol::{Frame, Header};
//! use bytes::Bytes;
//!
//! let header = Header::response(42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the call ID.
    #[inline]
    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    /// Check if this is a notification.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.header.is_notification()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The writer task sends header and payload as separate slices; this is for
/// callers that want one contiguous buffer (fake backends, tests).
///
/// # Example
///
/// ```
/// use flow_client::protocol::{build_frame, Header};
///
/// let header = Header::response(42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 9 + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
