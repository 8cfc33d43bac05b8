//! JSON wire protocol for live data synchronization.
//!
//! One message per WebSocket text frame, tagged by its `msg` field:
//! ```text
//! client → server   connect  method  sub  unsub  ping  pong
//! server → client   connected  failed  result  updated  ready  nosub
//!                   added  changed  removed  addedBefore  movedBefore
//!                   ping  pong  error
//! ```
//!
//! `changed` carries removed fields as a separate `cleared` list on the
//! wire; in memory both are folded into a single [`FieldChanges`] map.

use serde::{Deserialize, Serialize};

use crate::ejson::{FieldChanges, Fields, Value};

/// Protocol versions this implementation speaks, most preferred first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1", "pre2", "pre1"];

/// Error code carried in [`MethodError::error`]. Servers send either a
/// number (HTTP-like status) or a short string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Structured application error returned by methods and publications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(error: impl Into<ErrorCode>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: Some(reason.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Method dropped on reconnect because it was sent with `no_retry`.
    pub fn invocation_failed() -> Self {
        Self::new(
            "invocation-failed",
            "Method invocation might have failed due to dropped connection. \
             Failing because `no_retry` option was passed.",
        )
    }

    /// Connection closed for good while the method was outstanding.
    pub fn disconnected() -> Self {
        Self::new("disconnected", "Connection closed before the method completed")
    }

    pub fn is(&self, code: &str) -> bool {
        matches!(&self.error, ErrorCode::Text(t) if t == code)
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{reason} [{}]", self.error),
            None => write!(f, "[{}]", self.error),
        }
    }
}

impl std::error::Error for MethodError {}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        version: String,
        support: Vec<String>,
        session: Option<String>,
    },
    Connected {
        session: String,
    },
    Failed {
        version: Option<String>,
    },
    Method {
        method: String,
        params: Vec<Value>,
        id: String,
        random_seed: Option<Value>,
    },
    Result {
        id: String,
        result: Option<Value>,
        error: Option<MethodError>,
    },
    Updated {
        methods: Vec<String>,
    },
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
    Nosub {
        id: String,
        error: Option<MethodError>,
    },
    Ready {
        subs: Vec<String>,
    },
    Added {
        collection: String,
        id: String,
        fields: Fields,
    },
    Changed {
        collection: String,
        id: String,
        fields: FieldChanges,
    },
    Removed {
        collection: String,
        id: String,
    },
    AddedBefore {
        collection: String,
        id: String,
        fields: Fields,
        before: Option<String>,
    },
    MovedBefore {
        collection: String,
        id: String,
        before: Option<String>,
    },
    Ping {
        id: Option<String>,
    },
    Pong {
        id: Option<String>,
    },
    Error {
        reason: String,
        offending_message: Option<serde_json::Value>,
    },
    /// Legacy `{server_id}` welcome frame from old servers.
    ServerId(String),
}

const MESSAGE_TYPES: &[&str] = &[
    "connect",
    "connected",
    "failed",
    "method",
    "result",
    "updated",
    "sub",
    "unsub",
    "nosub",
    "ready",
    "added",
    "changed",
    "removed",
    "addedBefore",
    "movedBefore",
    "ping",
    "pong",
    "error",
];

/// Wire shape, one-to-one with the JSON objects on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg")]
enum Wire {
    #[serde(rename = "connect")]
    Connect {
        version: String,
        #[serde(default)]
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    #[serde(rename = "connected")]
    Connected { session: String },
    #[serde(rename = "failed")]
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    #[serde(rename = "method")]
    Method {
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        id: String,
        #[serde(rename = "randomSeed", default, skip_serializing_if = "Option::is_none")]
        random_seed: Option<Value>,
    },
    #[serde(rename = "result")]
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    #[serde(rename = "updated")]
    Updated { methods: Vec<String> },
    #[serde(rename = "sub")]
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    #[serde(rename = "unsub")]
    Unsub { id: String },
    #[serde(rename = "nosub")]
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    #[serde(rename = "ready")]
    Ready { subs: Vec<String> },
    #[serde(rename = "added")]
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Fields,
    },
    #[serde(rename = "changed")]
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    #[serde(rename = "removed")]
    Removed { collection: String, id: String },
    #[serde(rename = "addedBefore")]
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Fields,
        before: Option<String>,
    },
    #[serde(rename = "movedBefore")]
    MovedBefore {
        collection: String,
        id: String,
        before: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        reason: String,
        #[serde(rename = "offendingMessage", default, skip_serializing_if = "Option::is_none")]
        offending_message: Option<serde_json::Value>,
    },
}

impl Message {
    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        if let Message::ServerId(server_id) = self {
            return Ok(serde_json::json!({ "server_id": server_id }).to_string());
        }
        let wire = Wire::from(self.clone());
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a wire frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let serde_json::Value::Object(map) = &json else {
            return Err(ProtocolError::NotAnObject);
        };

        let msg_type = match map.get("msg") {
            Some(serde_json::Value::String(t)) => t.clone(),
            Some(_) => return Err(ProtocolError::Malformed("msg must be a string".into())),
            None => {
                if let Some(serde_json::Value::String(server_id)) = map.get("server_id") {
                    return Ok(Message::ServerId(server_id.clone()));
                }
                return Err(ProtocolError::MissingMsg);
            }
        };
        if !MESSAGE_TYPES.contains(&msg_type.as_str()) {
            return Err(ProtocolError::UnknownType(msg_type));
        }

        let wire: Wire =
            serde_json::from_value(json).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(wire.into())
    }

    /// The `msg` tag this message carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "connect",
            Message::Connected { .. } => "connected",
            Message::Failed { .. } => "failed",
            Message::Method { .. } => "method",
            Message::Result { .. } => "result",
            Message::Updated { .. } => "updated",
            Message::Sub { .. } => "sub",
            Message::Unsub { .. } => "unsub",
            Message::Nosub { .. } => "nosub",
            Message::Ready { .. } => "ready",
            Message::Added { .. } => "added",
            Message::Changed { .. } => "changed",
            Message::Removed { .. } => "removed",
            Message::AddedBefore { .. } => "addedBefore",
            Message::MovedBefore { .. } => "movedBefore",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Error { .. } => "error",
            Message::ServerId(_) => "server_id",
        }
    }

    /// Handshake for the given version.
    pub fn connect(version: &str, session: Option<String>) -> Self {
        Message::Connect {
            version: version.to_string(),
            support: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            session,
        }
    }
}

impl From<Message> for Wire {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Connect { version, support, session } => Wire::Connect { version, support, session },
            Message::Connected { session } => Wire::Connected { session },
            Message::Failed { version } => Wire::Failed { version },
            Message::Method { method, params, id, random_seed } => Wire::Method {
                method,
                params,
                id,
                random_seed,
            },
            Message::Result { id, result, error } => Wire::Result { id, result, error },
            Message::Updated { methods } => Wire::Updated { methods },
            Message::Sub { id, name, params } => Wire::Sub { id, name, params },
            Message::Unsub { id } => Wire::Unsub { id },
            Message::Nosub { id, error } => Wire::Nosub { id, error },
            Message::Ready { subs } => Wire::Ready { subs },
            Message::Added { collection, id, fields } => Wire::Added { collection, id, fields },
            Message::Changed { collection, id, fields: changes } => {
                let mut fields = Fields::new();
                let mut cleared = Vec::new();
                for (key, value) in changes {
                    match value {
                        Some(v) => {
                            fields.insert(key, v);
                        }
                        None => cleared.push(key),
                    }
                }
                Wire::Changed { collection, id, fields, cleared }
            }
            Message::Removed { collection, id } => Wire::Removed { collection, id },
            Message::AddedBefore { collection, id, fields, before } => Wire::AddedBefore {
                collection,
                id,
                fields,
                before,
            },
            Message::MovedBefore { collection, id, before } => Wire::MovedBefore { collection, id, before },
            Message::Ping { id } => Wire::Ping { id },
            Message::Pong { id } => Wire::Pong { id },
            Message::Error { reason, offending_message } => Wire::Error { reason, offending_message },
            // Encoded separately; the tagged wire enum has no slot for it.
            Message::ServerId(_) => Wire::Error {
                reason: "server_id".to_string(),
                offending_message: None,
            },
        }
    }
}

impl From<Wire> for Message {
    fn from(wire: Wire) -> Self {
        match wire {
            Wire::Connect { version, support, session } => Message::Connect { version, support, session },
            Wire::Connected { session } => Message::Connected { session },
            Wire::Failed { version } => Message::Failed { version },
            Wire::Method { method, params, id, random_seed } => Message::Method {
                method,
                params,
                id,
                random_seed,
            },
            Wire::Result { id, result, error } => Message::Result { id, result, error },
            Wire::Updated { methods } => Message::Updated { methods },
            Wire::Sub { id, name, params } => Message::Sub { id, name, params },
            Wire::Unsub { id } => Message::Unsub { id },
            Wire::Nosub { id, error } => Message::Nosub { id, error },
            Wire::Ready { subs } => Message::Ready { subs },
            Wire::Added { collection, id, fields } => Message::Added { collection, id, fields },
            Wire::Changed { collection, id, fields, cleared } => {
                let mut changes: FieldChanges = fields.into_iter().map(|(k, v)| (k, Some(v))).collect();
                for key in cleared {
                    changes.insert(key, None);
                }
                Message::Changed { collection, id, fields: changes }
            }
            Wire::Removed { collection, id } => Message::Removed { collection, id },
            Wire::AddedBefore { collection, id, fields, before } => Message::AddedBefore {
                collection,
                id,
                fields,
                before,
            },
            Wire::MovedBefore { collection, id, before } => Message::MovedBefore { collection, id, before },
            Wire::Ping { id } => Message::Ping { id },
            Wire::Pong { id } => Message::Pong { id },
            Wire::Error { reason, offending_message } => Message::Error { reason, offending_message },
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Malformed(String),
    NotAnObject,
    MissingMsg,
    UnknownType(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Malformed(e) => write!(f, "Malformed message: {e}"),
            Self::NotAnObject => write!(f, "Message is not a JSON object"),
            Self::MissingMsg => write!(f, "Message has no msg field"),
            Self::UnknownType(t) => write!(f, "Unknown message type: {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::fields;
    use serde_json::json;

    fn roundtrip(msg: Message) {
        let text = msg.encode().unwrap();
        assert_eq!(Message::decode(&text).unwrap(), msg, "frame: {text}");
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(Message::connect("1", None));
        roundtrip(Message::connect("pre2", Some("abc".into())));
    }

    #[test]
    fn test_method_roundtrip() {
        roundtrip(Message::Method {
            method: "setName".into(),
            params: vec![Value::from("u1"), Value::from("Bob")],
            id: "1".into(),
            random_seed: Some(Value::from("seed")),
        });
    }

    #[test]
    fn test_method_wire_shape() {
        let msg = Message::Method {
            method: "m".into(),
            params: vec![],
            id: "7".into(),
            random_seed: Some(Value::from("s")),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json, json!({"msg": "method", "method": "m", "params": [], "id": "7", "randomSeed": "s"}));
    }

    #[test]
    fn test_changed_splits_cleared() {
        let mut changes = FieldChanges::new();
        changes.insert("name".into(), Some(Value::from("Robert")));
        changes.insert("age".into(), None);
        let msg = Message::Changed {
            collection: "users".into(),
            id: "u1".into(),
            fields: changes,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["fields"], json!({"name": "Robert"}));
        assert_eq!(json["cleared"], json!(["age"]));
        roundtrip(msg);
    }

    #[test]
    fn test_added_with_date_field() {
        let text = r#"{"msg":"added","collection":"c","id":"x","fields":{"at":{"$date":1000}}}"#;
        let msg = Message::decode(text).unwrap();
        assert_eq!(
            msg,
            Message::Added {
                collection: "c".into(),
                id: "x".into(),
                fields: fields([("at", Value::Date(1000))]),
            }
        );
    }

    #[test]
    fn test_result_with_error() {
        let text = r#"{"msg":"result","id":"3","error":{"error":404,"reason":"Method not found"}}"#;
        let msg = Message::decode(text).unwrap();
        match &msg {
            Message::Result { id, result, error } => {
                assert_eq!(id, "3");
                assert!(result.is_none());
                assert_eq!(error.as_ref().unwrap().error, ErrorCode::Number(404));
            }
            other => panic!("unexpected {other:?}"),
        }
        roundtrip(msg);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(Message::decode("{not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(Message::decode("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(Message::decode("\"ping\""), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn test_missing_msg() {
        assert_eq!(Message::decode(r#"{"id":"1"}"#), Err(ProtocolError::MissingMsg));
    }

    #[test]
    fn test_legacy_server_id() {
        let msg = Message::decode(r#"{"server_id":"0"}"#).unwrap();
        assert_eq!(msg, Message::ServerId("0".into()));
        roundtrip(msg);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Message::decode(r#"{"msg":"teleport"}"#),
            Err(ProtocolError::UnknownType("teleport".into()))
        );
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        assert!(matches!(
            Message::decode(r#"{"msg":"result"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_ping_without_id() {
        assert_eq!(Message::decode(r#"{"msg":"ping"}"#).unwrap(), Message::Ping { id: None });
        assert_eq!(Message::Pong { id: None }.encode().unwrap(), r#"{"msg":"pong"}"#);
    }

    #[test]
    fn test_moved_before_null() {
        roundtrip(Message::MovedBefore {
            collection: "c".into(),
            id: "a".into(),
            before: None,
        });
    }

    #[test]
    fn test_error_offending_message() {
        roundtrip(Message::Error {
            reason: "Bad request".into(),
            offending_message: Some(json!({"msg": "bogus"})),
        });
    }

    #[test]
    fn test_method_error_display() {
        let err = MethodError::new(404, "Method 'x' not found");
        assert_eq!(err.to_string(), "Method 'x' not found [404]");
        assert!(MethodError::invocation_failed().is("invocation-failed"));
    }
}
