use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing CDP command (bridge to browser).
#[derive(Debug, Serialize)]
pub struct CdpCommand {
    /// Unique message id for response correlation.
    pub id: u64,
    /// CDP method name (e.g. `Page.navigate`).
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Session id for target-scoped commands.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// CDP protocol error payload returned by the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpProtocolError {
    /// JSON-RPC error code (e.g. -32000).
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

/// An asynchronous event pushed by the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// Event method name (e.g. `Network.requestWillBeSent`).
    pub method: String,
    /// Event parameters (`Value::Null` when absent).
    pub params: Value,
    /// Session id for target-scoped events.
    pub session_id: Option<String>,
}

/// A correlated response to a previously sent command.
#[derive(Debug)]
pub struct CdpResponse {
    /// The message id of the originating command.
    pub id: u64,
    /// Success payload or protocol error.
    pub result: Result<Value, CdpProtocolError>,
    /// Session id for target-scoped responses.
    pub session_id: Option<String>,
}

/// Every frame off the wire is deserialized into this union first and then
/// split into a response (has `id`) or an event (has `method`, no `id`).
#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub id: Option<u64>,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<CdpProtocolError>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// A classified incoming message.
pub enum Incoming {
    Response(CdpResponse),
    Event(CdpEvent),
}

impl WireMessage {
    /// Split into response or event. Returns `None` for frames carrying
    /// neither an `id` nor a `method` (nothing to route).
    #[must_use]
    pub fn into_incoming(self) -> Option<Incoming> {
        if let Some(id) = self.id {
            let result = match self.error {
                Some(err) => Err(err),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            return Some(Incoming::Response(CdpResponse {
                id,
                result,
                session_id: self.session_id,
            }));
        }
        let method = self.method?;
        Some(Incoming::Event(CdpEvent {
            method,
            params: self.params.unwrap_or(Value::Null),
            session_id: self.session_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_omits_absent_fields() {
        let cmd = CdpCommand {
            id: 7,
            method: "Browser.getVersion".into(),
            params: None,
            session_id: None,
        };
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["id"], 7);
        assert!(v.get("params").is_none());
        assert!(v.get("sessionId").is_none());
    }

    #[test]
    fn command_serializes_session_scope() {
        let cmd = CdpCommand {
            id: 8,
            method: "Page.navigate".into(),
            params: Some(json!({"url": "https://example.com"})),
            session_id: Some("sess-1".into()),
        };
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["sessionId"], "sess-1");
        assert_eq!(v["params"]["url"], "https://example.com");
    }

    #[test]
    fn response_frame_routes_as_response() {
        let raw: WireMessage =
            serde_json::from_str(r#"{"id": 3, "result": {"frameId": "F"}}"#).unwrap();
        match raw.into_incoming() {
            Some(Incoming::Response(resp)) => {
                assert_eq!(resp.id, 3);
                assert_eq!(resp.result.unwrap()["frameId"], "F");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn error_frame_carries_protocol_error() {
        let raw: WireMessage = serde_json::from_str(
            r#"{"id": 4, "error": {"code": -32000, "message": "No node for given backend id"}}"#,
        )
        .unwrap();
        match raw.into_incoming() {
            Some(Incoming::Response(resp)) => {
                let err = resp.result.unwrap_err();
                assert_eq!(err.code, -32000);
                assert!(err.message.contains("backend id"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn event_frame_routes_as_event() {
        let raw: WireMessage = serde_json::from_str(
            r#"{"method": "Page.frameNavigated", "params": {"frame": {"id": "F"}}, "sessionId": "s"}"#,
        )
        .unwrap();
        match raw.into_incoming() {
            Some(Incoming::Event(ev)) => {
                assert_eq!(ev.method, "Page.frameNavigated");
                assert_eq!(ev.session_id.as_deref(), Some("s"));
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn frame_without_id_or_method_is_dropped() {
        let raw: WireMessage = serde_json::from_str("{}").unwrap();
        assert!(raw.into_incoming().is_none());
    }

    #[test]
    fn response_without_result_defaults_to_null() {
        let raw: WireMessage = serde_json::from_str(r#"{"id": 11}"#).unwrap();
        match raw.into_incoming() {
            Some(Incoming::Response(resp)) => assert_eq!(resp.result.unwrap(), Value::Null),
            _ => panic!("expected response"),
        }
    }
}
