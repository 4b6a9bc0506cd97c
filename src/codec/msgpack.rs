//! MsgPack codec using `rmp-serde`.
//!
//! Always `to_vec_named`, never `to_vec`: the backend decodes structs as
//! maps keyed by field name.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode straight into `Bytes`, ready for an outbound frame.
    #[inline]
    pub fn encode_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Self::encode(value).map(Bytes::from)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use serde::Deserialize;
    use serde_json::{json, Value};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Params {
        #[serde(rename = "OrgID")]
        org_id: String,
        limit: u32,
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let params = Params {
            org_id: "o1".to_string(),
            limit: 10,
        };
        let encoded = MsgPackCodec::encode(&params).unwrap();

        // fixmap with 2 elements, not fixarray (0x92)
        assert_eq!(encoded[0], 0x82);

        let decoded: Params = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_struct_decodes_as_value() {
        let params = Params {
            org_id: "o1".to_string(),
            limit: 3,
        };
        let encoded = MsgPackCodec::encode(&params).unwrap();
        let value: Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(value, json!({"OrgID": "o1", "limit": 3}));
    }

    #[test]
    fn test_nested_value() {
        let original = json!({
            "regularMessages": [
                {"text": "hi", "channelId": "c1"},
                {"text": "there", "channelId": "c2", "extra": null}
            ],
            "count": -4,
            "ratio": 0.5
        });
        let encoded = MsgPackCodec::encode_bytes(&original).unwrap();
        let decoded: Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_null_is_msgpack_nil() {
        let encoded = MsgPackCodec::encode(&Value::Null).unwrap();
        assert_eq!(encoded, vec![0xc0]);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Params> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(matches!(result, Err(FlowError::MsgPackDecode(_))));
    }
}
