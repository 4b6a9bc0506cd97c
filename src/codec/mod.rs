//! Codec module - serialization/deserialization for payloads.
//!
//! Every payload on the channel is MessagePack. Structs go out as maps so the
//! backend sees field names (`method`, `params`, `type`, `data`, ...), never
//! positional arrays.
//!
//! # Example
//!
//! ```
//! use flow_client::codec::MsgPackCodec;
//! use serde_json::json;
//!
//! let encoded = MsgPackCodec::encode(&json!({"Username": "alice"})).unwrap();
//! let decoded: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded["Username"], "alice");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
