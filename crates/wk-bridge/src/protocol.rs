//! Wire types for the command endpoint and the WebSocket channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use wk_core::types::UserNo;
use wk_core::GameError;

/// Body of `POST /api`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRequest {
    pub user_no: UserNo,
    pub api_code: i64,
    #[serde(default)]
    pub data: Value,
}

/// Uniform command response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn error(err: &GameError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: json!({}),
        }
    }
}

/// Messages a client may send over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Heartbeat,
}

/// Server-initiated push payload: `{type, user_no, data}`.
pub fn push_message(event: &str, user_no: UserNo, data: &Value) -> Value {
    json!({ "type": event, "user_no": user_no, "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_data_defaults_to_null() {
        let req: ApiRequest =
            serde_json::from_str(r#"{"user_no": 1001, "api_code": 2001}"#).unwrap();
        assert_eq!(req.user_no, 1001);
        assert!(req.data.is_null());
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "ping", "timestamp": 123}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { timestamp: Some(123) }));
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "heartbeat"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "warp"}"#).is_err());
    }

    #[test]
    fn error_envelope_has_empty_data() {
        let resp = ApiResponse::error(&GameError::Conflict("busy".into()));
        assert!(!resp.success);
        assert_eq!(resp.message, "conflict: busy");
        assert_eq!(resp.data, json!({}));
    }
}
