use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute bag describing the debug target (at minimum `url`, `title`, `type`).
/// The relay treats it as opaque apart from the `url`/`title` patches it applies
/// after navigation.
pub type TargetInfo = Map<String, Value>;

/// Error payload of a debug-protocol response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
    /// Method-specific extra detail, relayed untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single debug-protocol message: command, response, or event.
///
/// Exactly one frame per WebSocket text message. Fields the relay does not
/// know about land in `extra` and survive a re-serialize, so forwarded
/// messages lose nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Request/response correlator. Absent on events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    /// Required on commands and events, absent on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Identifies the logical debug session the message belongs to.
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    /// Response payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Response payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// A response correlates by id and carries no method.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// An event carries a method and no id.
    pub fn is_event(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}

/// Control messages the agent sends outside the debug-protocol stream.
///
/// The first frame after the agent upgrade is expected to be a
/// `connection_info`; everything after that is plain [`Envelope`] traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ConnectionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "targetInfo", default)]
        target_info: Option<TargetInfo>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_envelope_roundtrip() {
        let json_in = r#"{"id":42,"sessionId":"s-1","method":"Page.navigate","params":{"url":"https://example.com"}}"#;
        let env: Envelope = serde_json::from_str(json_in).unwrap();
        assert_eq!(env.id, Some(42));
        assert_eq!(env.method.as_deref(), Some("Page.navigate"));
        assert_eq!(env.session_id.as_deref(), Some("s-1"));
        assert!(!env.is_response());
        assert!(!env.is_event());

        let out = serde_json::to_string(&env).unwrap();
        assert!(out.contains(r#""sessionId":"s-1""#));
        assert!(out.contains(r#""method":"Page.navigate""#));
    }

    #[test]
    fn response_classification() {
        let env: Envelope =
            serde_json::from_str(r#"{"id":7,"result":{"frameId":"f1"}}"#).unwrap();
        assert!(env.is_response());
        assert!(!env.is_event());
        assert_eq!(env.result.unwrap()["frameId"], "f1");
    }

    #[test]
    fn event_classification() {
        let env: Envelope = serde_json::from_str(
            r#"{"method":"Page.frameNavigated","params":{"frame":{"id":"f1"}}}"#,
        )
        .unwrap();
        assert!(env.is_event());
        assert!(!env.is_response());
    }

    #[test]
    fn error_response_carries_code_and_message() {
        let env: Envelope = serde_json::from_str(
            r#"{"id":3,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        let err = env.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found");
        assert!(err.data.is_none());
    }

    #[test]
    fn unknown_fields_survive_reserialization() {
        let json_in = r#"{"id":1,"method":"Custom.call","vendorTag":"x","nested":{"a":1}}"#;
        let env: Envelope = serde_json::from_str(json_in).unwrap();
        assert_eq!(env.extra["vendorTag"], "x");

        let out: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(out["vendorTag"], "x");
        assert_eq!(out["nested"]["a"], 1);
    }

    #[test]
    fn response_omits_absent_fields() {
        let env = Envelope {
            id: Some(9),
            result: Some(json!({})),
            ..Default::default()
        };
        let out = serde_json::to_string(&env).unwrap();
        assert!(!out.contains("method"));
        assert!(!out.contains("sessionId"));
        assert!(!out.contains("error"));
    }

    #[test]
    fn connection_info_parses() {
        let json_in = r#"{"type":"connection_info","sessionId":"s-1","targetInfo":{"targetId":"t","url":"about:blank","title":"","type":"page"}}"#;
        let ControlMessage::ConnectionInfo {
            session_id,
            target_info,
        } = serde_json::from_str(json_in).unwrap();
        assert_eq!(session_id, "s-1");
        let info = target_info.unwrap();
        assert_eq!(info["url"], "about:blank");
        assert_eq!(info["type"], "page");
    }

    #[test]
    fn connection_info_allows_null_target() {
        let json_in = r#"{"type":"connection_info","sessionId":"s-2","targetInfo":null}"#;
        let ControlMessage::ConnectionInfo { target_info, .. } =
            serde_json::from_str(json_in).unwrap();
        assert!(target_info.is_none());
    }

    #[test]
    fn plain_envelope_is_not_a_control_message() {
        let json_in = r#"{"id":1,"sessionId":"s-1","result":{}}"#;
        assert!(serde_json::from_str::<ControlMessage>(json_in).is_err());
    }
}
