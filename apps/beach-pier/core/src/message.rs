use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Text carried in the payload of an `ID-TAKEN` frame.
pub const ID_TAKEN_TEXT: &str = "ID is taken";

/// Kind of a wire frame.
///
/// The first four variants are reserved for the relay itself. Everything
/// else is negotiation traffic the relay forwards untouched, including
/// spellings it does not recognise, which round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Open,
    Error,
    IdTaken,
    Heartbeat,
    Offer,
    Answer,
    Candidate,
    Leave,
    Expire,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Error => "ERROR",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Leave => "LEAVE",
            MessageType::Expire => "EXPIRE",
            MessageType::Other(kind) => kind,
        }
    }

    /// Types only the relay may emit.
    pub fn is_server_reserved(&self) -> bool {
        matches!(
            self,
            MessageType::Open | MessageType::Error | MessageType::IdTaken | MessageType::Heartbeat
        )
    }

    /// Parses the lower-case kind segment used by the HTTP relay path
    /// (`offer`, `candidate`, `answer`, `leave`).
    pub fn from_relay_kind(kind: &str) -> Option<Self> {
        match MessageType::from(kind.to_ascii_uppercase()) {
            kind @ (MessageType::Offer
            | MessageType::Candidate
            | MessageType::Answer
            | MessageType::Leave) => Some(kind),
            _ => None,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "OPEN" => MessageType::Open,
            "ERROR" => MessageType::Error,
            "ID-TAKEN" => MessageType::IdTaken,
            "HEARTBEAT" => MessageType::Heartbeat,
            "OFFER" => MessageType::Offer,
            "ANSWER" => MessageType::Answer,
            "CANDIDATE" => MessageType::Candidate,
            "LEAVE" => MessageType::Leave,
            "EXPIRE" => MessageType::Expire,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single JSON frame, identical in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            src: None,
            dst: None,
            payload: Value::Null,
        }
    }

    pub fn open() -> Self {
        Self::new(MessageType::Open)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::new(MessageType::Error).with_payload(json!({ "msg": code.as_str() }))
    }

    pub fn id_taken() -> Self {
        Self::new(MessageType::IdTaken).with_payload(json!({ "msg": ID_TAKEN_TEXT }))
    }

    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Destination id, ignoring an empty string.
    pub fn destination(&self) -> Option<&str> {
        self.dst.as_deref().filter(|dst| !dst.is_empty())
    }

    /// The human readable `payload.msg` carried by relay notices.
    pub fn payload_text(&self) -> Option<&str> {
        self.payload.get("msg").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// Reasons carried in an `ERROR` frame before the relay hangs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParameters,
    InvalidKey,
    ConnectionLimitExceeded,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameters => "No id, token, or key supplied to websocket server",
            ErrorCode::InvalidKey => "Invalid key provided",
            ErrorCode::ConnectionLimitExceeded => "Server has reached its concurrent user limit",
        }
    }

    pub fn from_text(text: &str) -> Option<Self> {
        [
            ErrorCode::InvalidParameters,
            ErrorCode::InvalidKey,
            ErrorCode::ConnectionLimitExceeded,
        ]
        .into_iter()
        .find(|code| code.as_str() == text)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
