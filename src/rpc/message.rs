//! Wire shapes of the daemon control protocol.

use serde_json::{json, Value};
use std::time::Instant;

use super::RpcError;

/// An outbound call, alive until answered, timed out or cancelled.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub created_at: Instant,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
            created_at: Instant::now(),
        }
    }

    pub fn to_frame(&self) -> Value {
        let mut frame = json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "method": self.method,
        });
        // signal-cli rejects `"params": null`
        if !self.params.is_null() {
            frame["params"] = self.params.clone();
        }
        frame
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        /// `None` when the id is present but not one we could have issued
        id: Option<u64>,
        outcome: Result<Value, RpcError>,
    },
    Notification(Value),
}

/// Responses carry an `id` plus `result` or `error`; everything else is a
/// notification.
pub fn classify(frame: Value) -> Incoming {
    let is_response = frame.get("id").map_or(false, |id| !id.is_null())
        && (frame.get("result").is_some() || frame.get("error").is_some());

    if !is_response {
        return Incoming::Notification(frame);
    }

    let id = frame.get("id").and_then(parse_id);
    let outcome = match frame.get("error").filter(|e| !e.is_null()) {
        Some(err) => Err(remote_error(err)),
        None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
    };
    Incoming::Response { id, outcome }
}

fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn remote_error(err: &Value) -> RpcError {
    let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| err.to_string());
    RpcError::Remote { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_shape() {
        let req = Request::new(42, "send", json!({"recipient": ["+15551234567"], "message": "hi"}));
        let frame = req.to_frame();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 42);
        assert_eq!(frame["method"], "send");
        assert_eq!(frame["params"]["message"], "hi");

        let bare = Request::new(1, "listContacts", Value::Null).to_frame();
        assert!(bare.get("params").is_none());
    }

    #[test]
    fn classify_result_and_error() {
        match classify(json!({"jsonrpc": "2.0", "id": 3, "result": {"timestamp": 5}})) {
            Incoming::Response { id, outcome } => {
                assert_eq!(id, Some(3));
                assert_eq!(outcome.unwrap()["timestamp"], 5);
            }
            other => panic!("unexpected {:?}", other),
        }

        match classify(json!({"id": "4", "error": {"code": -32601, "message": "Method not implemented"}})) {
            Incoming::Response { id, outcome } => {
                assert_eq!(id, Some(4));
                let err = outcome.unwrap_err();
                assert!(err.is_method_missing());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn null_result_is_a_response() {
        assert!(matches!(
            classify(json!({"id": 9, "result": null})),
            Incoming::Response { id: Some(9), outcome: Ok(Value::Null) }
        ));
    }

    #[test]
    fn frames_without_id_are_notifications() {
        assert!(matches!(
            classify(json!({"jsonrpc": "2.0", "method": "receive", "params": {}})),
            Incoming::Notification(_)
        ));
        assert!(matches!(
            classify(json!({"contacts_changed": true})),
            Incoming::Notification(_)
        ));
        assert!(matches!(
            classify(json!({"id": null, "method": "receive"})),
            Incoming::Notification(_)
        ));
    }

    #[test]
    fn foreign_id_is_kept_as_unknown() {
        assert!(matches!(
            classify(json!({"id": "abc", "result": 1})),
            Incoming::Response { id: None, .. }
        ));
    }
}
