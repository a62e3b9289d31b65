#![forbid(unsafe_code)]

// Wire protocol - envelopes pushed by the chat service over the persistent connection

use serde::{Deserialize, Serialize};

/// Server-to-client envelope.
///
/// Every frame is `{"type": "...", "payload": ...}`. A well-formed envelope of
/// a type not listed here decodes as `Unknown`; anything else that fails to
/// decode ends the client's listen loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Chat message broadcast to every connected user
    Chat(ChatPayload),
    /// A user connected
    Join(PresencePayload),
    /// Current roster of online usernames
    Users(Vec<String>),
    /// A user disconnected
    Leave(PresencePayload),
    /// Error reported by the service
    Error(ErrorPayload),
    /// Envelope type this harness does not track; carries the type tag
    #[serde(skip)]
    Unknown(String),
}

const KNOWN_KINDS: [&str; 5] = ["chat", "join", "users", "leave", "error"];

/// Just the tag of an envelope, for frames that fail full decoding
#[derive(Deserialize)]
struct EnvelopeTag {
    #[serde(rename = "type")]
    kind: String,
}

/// Payload of a `chat` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// Payload of `join` / `leave` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub username: String,
}

/// Services report errors either as a bare string or as `{ "message": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Text(String),
    Detail { message: String },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Text(message) | ErrorPayload::Detail { message } => message,
        }
    }
}

impl ServerMessage {
    /// Decode one text frame.
    ///
    /// An envelope whose tag is not a known type becomes `Unknown`; a known
    /// type with a malformed payload, or a frame that is not an envelope at
    /// all, is an error.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Ok(msg),
            Err(e) => match serde_json::from_str::<EnvelopeTag>(text) {
                Ok(tag) if !KNOWN_KINDS.contains(&tag.kind.as_str()) => Ok(ServerMessage::Unknown(tag.kind)),
                _ => Err(e),
            },
        }
    }

    /// Chat content, if this is a chat envelope.
    pub fn chat_content(&self) -> Option<&str> {
        match self {
            ServerMessage::Chat(chat) => Some(&chat.content),
            _ => None,
        }
    }

    /// Short tag used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Chat(_) => "chat",
            ServerMessage::Join(_) => "join",
            ServerMessage::Users(_) => "users",
            ServerMessage::Leave(_) => "leave",
            ServerMessage::Error(_) => "error",
            ServerMessage::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat() {
        let text = r#"{"type":"chat","payload":{"content":"abc123:hello","user_id":7,"username":"alice","created_at":1700000000}}"#;
        let msg = ServerMessage::decode(text).unwrap();
        assert_eq!(msg.chat_content(), Some("abc123:hello"));
        match msg {
            ServerMessage::Chat(chat) => {
                assert_eq!(chat.username.as_deref(), Some("alice"));
                assert_eq!(chat.user_id, Some(7));
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_presence_and_roster() {
        let join = ServerMessage::decode(r#"{"type":"join","payload":{"username":"bob"}}"#).unwrap();
        assert_eq!(join, ServerMessage::Join(PresencePayload { username: "bob".into() }));

        let users = ServerMessage::decode(r#"{"type":"users","payload":["bob","carol"]}"#).unwrap();
        assert_eq!(users, ServerMessage::Users(vec!["bob".into(), "carol".into()]));

        let leave = ServerMessage::decode(r#"{"type":"leave","payload":{"username":"bob"}}"#).unwrap();
        assert_eq!(leave.kind(), "leave");
        assert_eq!(leave.chat_content(), None);
    }

    #[test]
    fn test_decode_error_shapes() {
        let bare = ServerMessage::decode(r#"{"type":"error","payload":"rate limited"}"#).unwrap();
        let detail = ServerMessage::decode(r#"{"type":"error","payload":{"message":"rate limited"}}"#).unwrap();
        for msg in [bare, detail] {
            match msg {
                ServerMessage::Error(payload) => assert_eq!(payload.message(), "rate limited"),
                other => panic!("expected error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let typing = ServerMessage::decode(r#"{"type":"typing","payload":{"username":"bob"}}"#).unwrap();
        assert_eq!(typing, ServerMessage::Unknown("typing".into()));
        assert_eq!(typing.kind(), "unknown");
        assert_eq!(typing.chat_content(), None);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(ServerMessage::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"payload":{}}"#).is_err());
        // Known type, wrong payload shape
        assert!(ServerMessage::decode(r#"{"type":"chat","payload":{"user_id":1}}"#).is_err());
        assert!(ServerMessage::decode(r#"{"type":"users","payload":"bob"}"#).is_err());
    }

    #[test]
    fn test_encode_matches_wire_shape() {
        let msg = ServerMessage::Chat(ChatPayload {
            content: "hi".into(),
            username: None,
            user_id: None,
            created_at: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "chat", "payload": {"content": "hi"}}));
    }
}
