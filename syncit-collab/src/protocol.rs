//! Wire frames and addressing for the file editing protocol.
//!
//! Inbound events are addressed by destination, outbound frames by topic:
//! ```text
//! /app/file/{id}/open   ──►  {"sender":"server","content":"..."}  ──► /topic/file/{id}
//! /app/file/{id}/edit   ──►  raw edit bytes, unchanged            ──► /topic/file/{id}
//! /app/file/{id}/close  ──►  (no frame)
//! ```
//!
//! Transport envelopes ([`ClientCommand`], [`ServerMessage`]) are JSON text
//! messages carried over the WebSocket connection.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runner::RunOutput;
use crate::session::FileId;

const DESTINATION_PREFIX: &str = "/app";
const FILE_SEGMENT: &str = "file";
const TOPIC_PREFIX: &str = "/topic/file/";

/// An immutable serialized message published on a topic.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Frame(Arc<[u8]>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The frame as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self::from(text.into_bytes())
    }
}

/// Response to an open event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenResponse {
    pub sender: String,
    pub content: String,
}

impl OpenResponse {
    pub const SENDER: &'static str = "server";

    pub fn new(content: impl Into<String>) -> Self {
        Self {
            sender: Self::SENDER.to_string(),
            content: content.into(),
        }
    }

    pub fn encode(&self) -> Result<Frame, FrameError> {
        Ok(Frame::from(serde_json::to_vec(self)?))
    }
}

/// The part of an edit payload the server reads.
///
/// Only `content` is interpreted; every other field is left to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFrame {
    content: String,
}

impl EditFrame {
    /// Parse a raw edit payload. A missing or `null` `content` reads as "".
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_slice(raw)?;
        let Value::Object(mut fields) = value else {
            return Err(FrameError::NotAnObject);
        };
        let content = match fields.remove("content") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text,
            Some(_) => return Err(FrameError::ContentNotString),
        };
        Ok(Self { content })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_content(self) -> String {
        self.content
    }
}

/// Inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Edit,
    Close,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Edit => "edit",
            Self::Close => "close",
        }
    }
}

/// Address of an inbound event: `/app/file/{id}/{open|edit|close}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub file_id: FileId,
    pub kind: EventKind,
}

impl Destination {
    pub fn new(file_id: FileId, kind: EventKind) -> Self {
        Self { file_id, kind }
    }

    /// Parse a destination path. The `/app` prefix is optional.
    pub fn parse(path: &str) -> Result<Self, FrameError> {
        let unknown = || FrameError::UnknownDestination(path.to_string());

        let rest = path.strip_prefix(DESTINATION_PREFIX).unwrap_or(path);
        let mut segments = rest.strip_prefix('/').ok_or_else(unknown)?.split('/');

        if segments.next() != Some(FILE_SEGMENT) {
            return Err(unknown());
        }
        let file_id = segments
            .next()
            .and_then(|s| s.parse::<FileId>().ok())
            .ok_or_else(unknown)?;
        let kind = match segments.next() {
            Some("open") => EventKind::Open,
            Some("edit") => EventKind::Edit,
            Some("close") => EventKind::Close,
            _ => return Err(unknown()),
        };
        if segments.next().is_some() {
            return Err(unknown());
        }

        Ok(Self { file_id, kind })
    }

    pub fn topic(&self) -> String {
        topic_for(self.file_id)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DESTINATION_PREFIX}/{FILE_SEGMENT}/{}/{}",
            self.file_id,
            self.kind.as_str()
        )
    }
}

/// Topic name for a file: `/topic/file/{id}`.
pub fn topic_for(file_id: FileId) -> String {
    format!("{TOPIC_PREFIX}{file_id}")
}

/// Inverse of [`topic_for`].
pub fn parse_topic(topic: &str) -> Option<FileId> {
    topic.strip_prefix(TOPIC_PREFIX)?.parse().ok()
}

/// Command sent by a client over its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Send {
        destination: String,
        #[serde(default)]
        body: String,
    },
    /// Execute a file; answered only to the requesting connection.
    Run {
        file_id: FileId,
        extension: String,
    },
}

impl ClientCommand {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message pushed by the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A frame published on a subscribed topic; `body` is the frame text.
    Message { topic: String, body: String },
    /// A command from this client was rejected.
    Error { message: String },
    RunResult { file_id: FileId, output: RunOutput },
    /// `reason` is a stable machine-readable failure kind.
    RunFailed {
        file_id: FileId,
        reason: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn from_frame(file_id: FileId, frame: &Frame) -> Self {
        Self::Message {
            topic: topic_for(file_id),
            body: String::from_utf8_lossy(frame.as_bytes()).into_owned(),
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame and addressing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("edit frame must be a JSON object")]
    NotAnObject,
    #[error("edit frame `content` must be a string")]
    ContentNotString,
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_response_exact_shape() {
        let frame = OpenResponse::new("hello").encode().unwrap();
        assert_eq!(frame.as_str(), Some(r#"{"sender":"server","content":"hello"}"#));
    }

    #[test]
    fn test_open_response_escapes_content() {
        let frame = OpenResponse::new("line\n\"quoted\"").encode().unwrap();
        let decoded: OpenResponse = serde_json::from_slice(frame.as_bytes()).unwrap();
        assert_eq!(decoded, OpenResponse::new("line\n\"quoted\""));
    }

    #[test]
    fn test_edit_frame_reads_content() {
        let edit = EditFrame::parse(br#"{"content":"hello world","cursor":3}"#).unwrap();
        assert_eq!(edit.content(), "hello world");
    }

    #[test]
    fn test_edit_frame_missing_or_null_content() {
        assert_eq!(EditFrame::parse(br#"{"sender":"bob"}"#).unwrap().content(), "");
        assert_eq!(EditFrame::parse(br#"{"content":null}"#).unwrap().content(), "");
    }

    #[test]
    fn test_edit_frame_rejects_bad_shapes() {
        assert!(matches!(EditFrame::parse(b"not json"), Err(FrameError::Json(_))));
        assert!(matches!(EditFrame::parse(br#"["content"]"#), Err(FrameError::NotAnObject)));
        assert!(matches!(
            EditFrame::parse(br#"{"content":42}"#),
            Err(FrameError::ContentNotString)
        ));
    }

    #[test]
    fn test_frame_preserves_bytes() {
        let raw = r#"{ "content" : "x",   "extra": [1, 2] }"#;
        let frame = Frame::from(raw);
        assert_eq!(frame.as_bytes(), raw.as_bytes());
        assert_eq!(frame.len(), raw.len());
    }

    #[test]
    fn test_destination_parse() {
        let dest = Destination::parse("/app/file/12/edit").unwrap();
        assert_eq!(dest, Destination::new(FileId(12), EventKind::Edit));
        assert_eq!(dest.topic(), "/topic/file/12");
        assert_eq!(dest.to_string(), "/app/file/12/edit");

        let bare = Destination::parse("/file/3/close").unwrap();
        assert_eq!(bare.kind, EventKind::Close);
    }

    #[test]
    fn test_destination_rejects_unknown() {
        for path in [
            "",
            "file/1/open",
            "/app/files/1/open",
            "/app/file/abc/open",
            "/app/file/1/rename",
            "/app/file/1/open/extra",
            "/app/file/1",
        ] {
            assert!(
                matches!(Destination::parse(path), Err(FrameError::UnknownDestination(_))),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_topic_roundtrip() {
        assert_eq!(parse_topic(&topic_for(FileId(-5))), Some(FileId(-5)));
        assert_eq!(parse_topic("/topic/room/5"), None);
    }

    #[test]
    fn test_client_command_wire_shape() {
        let cmd = ClientCommand::decode(
            r#"{"command":"send","destination":"/app/file/1/open"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Send {
                destination: "/app/file/1/open".into(),
                body: String::new(),
            }
        );

        let sub = ClientCommand::Subscribe { topic: "/topic/file/1".into() };
        assert_eq!(
            sub.encode().unwrap(),
            r#"{"command":"subscribe","topic":"/topic/file/1"}"#
        );
    }

    #[test]
    fn test_run_command_wire_shape() {
        let cmd = ClientCommand::decode(r#"{"command":"run","file_id":3,"extension":"py"}"#)
            .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Run {
                file_id: FileId(3),
                extension: "py".into(),
            }
        );
    }

    #[test]
    fn test_server_message_carries_frame_text() {
        let frame = Frame::from(r#"{"content":"hi"}"#);
        let msg = ServerMessage::from_frame(FileId(8), &frame);
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            decoded,
            ServerMessage::Message {
                topic: "/topic/file/8".into(),
                body: r#"{"content":"hi"}"#.into(),
            }
        );
    }
}
