//! Wire format encoding and decoding.
//!
//! Implements the 9-byte header format:
//! ```text
//! ┌───────┬──────────┬──────────┐
//! │ Flags │ Call ID  │ Length   │
//! │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │       │ uint32 BE│ uint32 BE│
//! └───────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. Call ID 0 is reserved for
//! notifications pushed by the backend.

use crate::error::{FlowError, Result};

/// Header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Call ID carried by notification frames.
pub const NOTIFICATION_CALL_ID: u32 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: to backend (1) or to client (0).
    pub const TO_BACKEND: u8 = 0b0000_0001;
    /// Message type: response (1) or request/notification (0).
    pub const IS_RESPONSE: u8 = 0b0000_0010;
    /// Error flag: error (1) or ok (0).
    pub const IS_ERROR: u8 = 0b0000_0100;
    /// Unsolicited push from the backend.
    pub const IS_NOTIFICATION: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Request flags: to_backend = 0x01
    pub const REQUEST: u8 = TO_BACKEND;
    /// Response flags: is_response = 0x02
    pub const RESPONSE: u8 = IS_RESPONSE;
    /// Error response flags: is_response + is_error = 0x06
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
    /// Notification flags: is_notification = 0x08
    pub const NOTIFICATION: u8 = IS_NOTIFICATION;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Call identifier (0 = notification).
    pub call_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, call_id: u32, payload_length: u32) -> Self {
        Self {
            flags,
            call_id,
            payload_length,
        }
    }

    /// Header for a client request.
    pub fn request(call_id: u32, payload_length: u32) -> Self {
        Self::new(flags::REQUEST, call_id, payload_length)
    }

    /// Header for a successful response to `call_id`.
    pub fn response(call_id: u32, payload_length: u32) -> Self {
        Self::new(flags::RESPONSE, call_id, payload_length)
    }

    /// Header for a failed response to `call_id`.
    pub fn error_response(call_id: u32, payload_length: u32) -> Self {
        Self::new(flags::ERROR_RESPONSE, call_id, payload_length)
    }

    /// Header for a backend notification.
    pub fn notification(payload_length: u32) -> Self {
        Self::new(flags::NOTIFICATION, NOTIFICATION_CALL_ID, payload_length)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use flow_client::protocol::Header;
    ///
    /// let header = Header::response(42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 9);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (9 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.call_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use flow_client::protocol::Header;
    ///
    /// let bytes = [0x02, 0, 0, 0, 42, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.call_id, 42);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[0],
            call_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            payload_length: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Reserved flag bits are 0
    /// - Notifications carry call ID 0, everything else a non-zero call ID
    /// - A notification is never also a response
    ///
    /// Payload size is enforced by the frame buffer, where an oversize
    /// length is fatal rather than a droppable frame.
    pub fn validate(&self) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(FlowError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.is_notification() {
            if self.is_response() {
                return Err(FlowError::Protocol(
                    "Notification cannot be a response".to_string(),
                ));
            }
            if self.call_id != NOTIFICATION_CALL_ID {
                return Err(FlowError::Protocol(format!(
                    "Notification carries call ID {}",
                    self.call_id
                )));
            }
        } else if self.call_id == NOTIFICATION_CALL_ID {
            return Err(FlowError::Protocol(
                "Call ID 0 is reserved for notifications".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if this is a notification.
    #[inline]
    pub fn is_notification(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_NOTIFICATION)
    }

    /// Check if direction is to backend.
    #[inline]
    pub fn is_to_backend(&self) -> bool {
        flags::has_flag(self.flags, flags::TO_BACKEND)
    }
}
