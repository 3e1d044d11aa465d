//! Message envelopes exchanged between clients, sessions and the front-end peer.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a session, assigned by the [`SessionRegistry`](crate::registry::SessionRegistry)
/// at registration time.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub(crate) u32);

impl From<SessionId> for u32 {
    fn from(val: SessionId) -> Self {
        val.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id of a request, echoed back in its response.
///
/// Unique within the in-flight requests of a single client.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub(crate) u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// A method invocation on the remote viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// The logical message exchanged over a session.
///
/// Serialized as `{ "id": .., "type": .., "data": .. }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ViewerMethod {
        #[serde(default)]
        id: Option<MessageId>,
        data: MethodCall,
    },
    Response {
        #[serde(default)]
        id: Option<MessageId>,
        #[serde(default)]
        data: Value,
    },
    Error {
        #[serde(default)]
        id: Option<MessageId>,
        #[serde(default)]
        data: Value,
    },
    Binary {
        #[serde(default)]
        id: Option<MessageId>,
        data: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Envelope {
    /// Builds a viewer method call. Keyword arguments, when present, are
    /// appended as the trailing positional argument.
    pub fn viewer_method(
        id: MessageId,
        method: impl Into<String>,
        mut args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Self {
        if !kwargs.is_empty() {
            args.push(Value::Object(kwargs));
        }
        Envelope::ViewerMethod {
            id: Some(id),
            data: MethodCall {
                method: method.into(),
                args,
            },
        }
    }

    pub fn response(id: MessageId, data: Value) -> Self {
        Envelope::Response { id: Some(id), data }
    }

    pub fn error(id: MessageId, data: impl Into<Value>) -> Self {
        Envelope::Error {
            id: Some(id),
            data: data.into(),
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        match self {
            Envelope::ViewerMethod { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Error { id, .. }
            | Envelope::Binary { id, .. } => *id,
        }
    }

    /// The wire tag of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ViewerMethod { .. } => "viewer_method",
            Envelope::Response { .. } => "response",
            Envelope::Error { .. } => "error",
            Envelope::Binary { .. } => "binary",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_payload(self) -> Payload {
        match self {
            Envelope::Binary { data, .. } => Payload::Binary(data),
            other => Payload::Text(other),
        }
    }
}

/// An outbound frame: either raw bytes or a structured envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Vec<u8>),
    Text(Envelope),
}

impl Payload {
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Bytes as they go on the wire.
    pub fn into_bytes(self) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            Payload::Binary(bytes) => Ok(bytes),
            Payload::Text(envelope) => envelope.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn viewer_method_wire_shape() {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("force".into(), json!(true));
        let env = Envelope::viewer_method(MessageId::new(7), "save", vec![json!(1)], kwargs);
        let value: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "viewer_method",
                "id": 7,
                "data": { "method": "save", "args": [1, { "force": true }] }
            })
        );
    }

    #[test]
    fn empty_kwargs_are_not_appended() {
        let env = Envelope::viewer_method(
            MessageId::new(1),
            "restore",
            vec![],
            serde_json::Map::new(),
        );
        match env {
            Envelope::ViewerMethod { data, .. } => assert!(data.args.is_empty()),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn parses_notification_without_id() {
        let env = Envelope::from_slice(br#"{"type":"response","data":{"ok":true}}"#).unwrap();
        assert_eq!(env.id(), None);
        assert_eq!(env.kind(), "response");
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = Envelope::from_slice(br#"{"type":"table","id":1}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn binary_envelopes_become_binary_frames() {
        let payload = Envelope::Binary {
            id: None,
            data: vec![1, 2, 3],
        }
        .into_payload();
        assert!(payload.is_binary());
        assert_eq!(payload.into_bytes().unwrap(), vec![1, 2, 3]);

        let payload = Envelope::response(MessageId::new(3), json!("ok")).into_payload();
        assert!(!payload.is_binary());
    }
}
