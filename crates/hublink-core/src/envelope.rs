//! JSON wire envelope and framing codec.
//!
//! The wire format is line-delimited JSON: one document per `\n`-terminated
//! frame. Three shapes travel on it:
//!
//! - request: `{"id": 7, "method": "Ns.Method", "params": {...}, "token": "..."}`
//! - reply: `{"id": 7, "status": "success", "params": {...}}` or
//!   `{"id": 7, "status": "error", "error": "..."}`
//! - notification: `{"notification": "Ns.Method", "params": {...}}`
//!
//! [`EnvelopeCodec`] owns the receive buffer. A partial frame is retained for
//! the next arrival; a malformed frame is dropped with a warning without
//! touching the bytes that follow it.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Split `"Namespace.Method"` into its two non-empty halves.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    let (namespace, name) = method.split_once('.')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

/// Outgoing call envelope. Also the shape a hub-side peer decodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    /// `"Namespace.Method"`.
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Session credential, attached once authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Reply to a request, matched by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyEnvelope {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Unsolicited server-to-client message; carries no `id`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub namespace: String,
    pub method: String,
    pub params: Value,
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Reply(ReplyEnvelope),
    Notification(Notification),
}

/// Encode one request frame, trailing delimiter included.
pub fn encode_request(
    id: u64,
    namespace: &str,
    method: &str,
    params: &Value,
    token: Option<&str>,
) -> Bytes {
    let envelope = RequestEnvelope {
        id,
        method: format!("{namespace}.{method}"),
        params: params.clone(),
        token: token.map(str::to_owned),
    };
    let mut wire = serde_json::to_vec(&envelope).expect("JSON value serialization cannot fail");
    wire.push(b'\n');
    Bytes::from(wire)
}

/// Decode a request frame (hub side of the wire; used by the testkit).
pub fn decode_request(frame: &[u8]) -> Result<RequestEnvelope, ProtocolError> {
    let request: RequestEnvelope = serde_json::from_slice(frame)?;
    if split_method(&request.method).is_none() {
        return Err(ProtocolError::BadMethod(request.method));
    }
    Ok(request)
}

/// Decode one complete frame into a reply or a notification.
pub fn decode_frame(frame: &[u8]) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(frame)?;
    let Value::Object(ref map) = value else {
        return Err(ProtocolError::UnknownShape);
    };

    if let Some(name) = map.get("notification") {
        let Some(name) = name.as_str() else {
            return Err(ProtocolError::UnknownShape);
        };
        let (namespace, method) =
            split_method(name).ok_or_else(|| ProtocolError::BadMethod(name.to_owned()))?;
        return Ok(InboundMessage::Notification(Notification {
            namespace: namespace.to_owned(),
            method: method.to_owned(),
            params: map.get("params").cloned().unwrap_or(Value::Null),
        }));
    }

    if map.contains_key("id") {
        let reply: ReplyEnvelope = serde_json::from_value(value)?;
        return Ok(InboundMessage::Reply(reply));
    }

    Err(ProtocolError::UnknownShape)
}

/// Framing codec over a growing receive buffer.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    buf: BytesMut,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly arrived bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop any buffered partial frame. Used on disconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered (diagnostics).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete, decodable frame.
    ///
    /// Malformed frames are dropped here; only the offending frame is lost.
    /// Returns `None` once no complete frame remains.
    pub fn next_message(&mut self) -> Option<InboundMessage> {
        loop {
            let end = self.buf.iter().position(|&b| b == b'\n')?;
            let frame = self.buf.split_to(end + 1);
            let frame = &frame[..end];
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode_frame(frame) {
                Ok(message) => return Some(message),
                Err(error) => {
                    tracing::warn!(%error, frame_len = frame.len(), "dropping malformed frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let params = json!({"username": "a", "password": "b"});
        let wire = encode_request(4, "Users", "CreateUser", &params, None);
        assert_eq!(wire.last(), Some(&b'\n'));

        let request = decode_request(&wire[..wire.len() - 1]).unwrap();
        assert_eq!(request.id, 4);
        assert_eq!(request.method, "Users.CreateUser");
        assert_eq!(request.params, params);
        assert_eq!(request.token, None);
        assert_eq!(
            split_method(&request.method),
            Some(("Users", "CreateUser"))
        );
    }

    #[test]
    fn token_is_omitted_until_present() {
        let without = encode_request(1, "Devices", "List", &Value::Null, None);
        assert!(!without.windows(7).any(|w| w == b"\"token\""));

        let with = encode_request(2, "Devices", "List", &Value::Null, Some("secret"));
        let request = decode_request(&with[..with.len() - 1]).unwrap();
        assert_eq!(request.token.as_deref(), Some("secret"));
    }

    #[test]
    fn fragmented_frames_are_reassembled() {
        let mut codec = EnvelopeCodec::new();
        codec.extend(br#"{"id": 1, "status": "succ"#);
        assert!(codec.next_message().is_none());
        codec.extend(br#"ess", "params": {"ok": true}}"#);
        assert!(codec.next_message().is_none());
        codec.extend(b"\n");

        match codec.next_message() {
            Some(InboundMessage::Reply(reply)) => {
                assert_eq!(reply.id, 1);
                assert!(reply.is_success());
                assert_eq!(reply.params, json!({"ok": true}));
            }
            other => panic!("expected reply, got {other:?}"),
        }
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn two_frames_in_one_arrival() {
        let mut codec = EnvelopeCodec::new();
        codec.extend(
            b"{\"id\": 1, \"status\": \"success\"}\n{\"notification\": \"Devices.StateChanged\", \"params\": {}}\n",
        );
        assert!(matches!(
            codec.next_message(),
            Some(InboundMessage::Reply(_))
        ));
        match codec.next_message() {
            Some(InboundMessage::Notification(n)) => {
                assert_eq!(n.namespace, "Devices");
                assert_eq!(n.method, "StateChanged");
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(codec.next_message().is_none());
    }

    #[test]
    fn malformed_frame_drops_only_itself() {
        let mut codec = EnvelopeCodec::new();
        codec.extend(b"this is not json\n{\"id\": 9, \"status\": \"error\", \"error\": \"nope\"}\n");

        match codec.next_message() {
            Some(InboundMessage::Reply(reply)) => {
                assert_eq!(reply.id, 9);
                assert!(!reply.is_success());
                assert_eq!(reply.error.as_deref(), Some("nope"));
            }
            other => panic!("expected reply after the bad frame, got {other:?}"),
        }
    }

    #[test]
    fn frame_with_neither_id_nor_notification_is_dropped() {
        let mut codec = EnvelopeCodec::new();
        codec.extend(b"{\"hello\": true}\n");
        assert!(codec.next_message().is_none());
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = EnvelopeCodec::new();
        codec.extend(b"\n  \n{\"id\": 3, \"status\": \"success\"}\n");
        assert!(matches!(
            codec.next_message(),
            Some(InboundMessage::Reply(r)) if r.id == 3
        ));
    }

    #[test]
    fn bad_method_strings_are_rejected() {
        assert!(split_method("NoSeparator").is_none());
        assert!(split_method(".Leading").is_none());
        assert!(split_method("Trailing.").is_none());
        assert!(split_method("Devices.StateChanged").is_some());

        let mut codec = EnvelopeCodec::new();
        codec.extend(b"{\"notification\": \"oops\", \"params\": {}}\n");
        assert!(codec.next_message().is_none());
    }
}
