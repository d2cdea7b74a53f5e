//! JSON-RPC 2.0 envelopes exchanged with Moonraker
//!
//! Outbound requests carry `{jsonrpc, method, params, id}`. Inbound frames
//! are either responses (`id` plus `result` or `error`) or notifications
//! (`method` plus an array of `params`, no `id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol marker sent with every request
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request envelope
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
    pub id: u64,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id,
        }
    }
}

/// Error object of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Any frame received from the server, before classification
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// Unsolicited push from the server
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Notification {
    /// Build a notification, accepting both array and bare params
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        let params = match params {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        Self {
            method: method.into(),
            params,
        }
    }

    /// First parameter, which carries the payload object for status updates
    pub fn payload(&self) -> Option<&Value> {
        self.params.first()
    }
}

/// Counters kept per client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Frames received from the server
    pub messages_received: u64,

    /// Requests written to the channel
    pub requests_sent: u64,

    /// Notifications fanned out to listeners
    pub notifications_dispatched: u64,

    /// Frames dropped because they could not be parsed
    pub malformed_dropped: u64,

    /// Requests that hit their deadline
    pub requests_timed_out: u64,

    /// When the current channel opened
    pub connection_start: Option<chrono::DateTime<chrono::Utc>>,

    /// Last frame received
    pub last_message: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_envelope() {
        let params = json!({"script": "G28"});
        let request = RpcRequest::new(7, "printer.gcode.script", &params);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "printer.gcode.script",
                "params": {"script": "G28"},
                "id": 7
            })
        );
    }

    #[test]
    fn test_parse_error_response() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        assert_eq!(message.id, Some(3));
        assert_eq!(
            message.error,
            Some(RpcError {
                code: -32601,
                message: "Method not found".into()
            })
        );
        assert!(message.method.is_none());
    }

    #[test]
    fn test_notification_params() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notify_status_update","params":[{"toolhead":{}},1234.5]}"#,
        )
        .unwrap();
        let notification = Notification::new(message.method.unwrap(), message.params);
        assert_eq!(notification.params.len(), 2);
        assert_eq!(notification.payload(), Some(&json!({"toolhead": {}})));

        let bare = Notification::new("notify_klippy_ready", None);
        assert!(bare.payload().is_none());

        let object = Notification::new("custom", Some(json!({"a": 1})));
        assert_eq!(object.params, vec![json!({"a": 1})]);
    }
}
