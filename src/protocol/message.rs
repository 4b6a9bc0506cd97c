//! Payload shapes carried inside frames.
//!
//! - request (`TO_BACKEND`): `{method, params}`
//! - success response: the result value itself
//! - error response: `{message}`
//! - notification: `{type, data}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request body, borrowed so callers keep their params.
#[derive(Debug, Serialize)]
pub struct RequestRef<'a> {
    pub method: &'a str,
    pub params: &'a Value,
}

/// Request body as seen by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Body of an `IS_ERROR` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Body of a notification frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub category: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use serde_json::json;

    #[test]
    fn test_request_ref_decodes_as_request() {
        let params = json!({"Username": "alice"});
        let bytes = MsgPackCodec::encode(&RequestRef {
            method: "StartUp",
            params: &params,
        })
        .unwrap();

        let request: Request = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(request.method, "StartUp");
        assert_eq!(request.params, params);
    }

    #[test]
    fn test_notification_uses_type_key() {
        let payload = NotificationPayload {
            category: "message".into(),
            data: json!({"text": "hi"}),
        };
        let value: Value = MsgPackCodec::decode(&MsgPackCodec::encode(&payload).unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["text"], "hi");
    }

    #[test]
    fn test_notification_without_data() {
        let bytes = MsgPackCodec::encode(&json!({"type": "hwm"})).unwrap();
        let payload: NotificationPayload = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(payload.category, "hwm");
        assert_eq!(payload.data, Value::Null);
    }
}
