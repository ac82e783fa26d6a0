//! IPC protocol types for host ↔ worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over the worker's stdin/stdout.
//! Every message is a flat object tagged by its `type` field. A request may
//! carry a numeric `id`; the worker echoes it on every response produced for
//! that request, which lets the host demultiplex responses per request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a request with the responses it produces.
pub type RequestId = u64;

/// Default generation length when a request does not specify one.
pub const DEFAULT_MAX_TOKENS: u32 = 512;
/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Default nucleus sampling mass.
pub const DEFAULT_TOP_P: f32 = 0.95;

/// Request tags the worker understands.
pub const REQUEST_TYPES: &[&str] = &["completion", "chat", "unload", "ping"];

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f32 {
    DEFAULT_TOP_P
}

/// Speaker of a chat message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a chat conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Payload of a `completion` request: raw prompt continuation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Stop sequences. Serialized as `null` when absent.
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            stop: None,
            stream: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = Some(stop.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Stop sequences, treating `null` as empty.
    pub fn stop_sequences(&self) -> &[String] {
        self.stop.as_deref().unwrap_or(&[])
    }
}

/// Payload of a `chat` request: a conversation rendered by the worker's chat format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            stream: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Requests the host can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestMessage {
    /// Continue a raw prompt.
    Completion(CompletionRequest),
    /// Answer a conversation.
    Chat(ChatRequest),
    /// Release the model; the worker exits after acknowledging.
    Unload,
    /// Health check.
    Ping,
}

impl RequestMessage {
    /// Wire tag of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestMessage::Completion(_) => "completion",
            RequestMessage::Chat(_) => "chat",
            RequestMessage::Unload => "unload",
            RequestMessage::Ping => "ping",
        }
    }
}

/// A request line: optional correlation id plus the tagged message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub message: RequestMessage,
}

impl RequestEnvelope {
    pub fn new(id: RequestId, message: RequestMessage) -> Self {
        Self {
            id: Some(id),
            message,
        }
    }
}

/// Token accounting reported with every non-streaming answer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Responses the worker writes to stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseMessage {
    /// Model load has begun.
    Loading {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Model loaded; the worker accepts requests.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Answer to a non-streaming `completion`.
    Completion {
        text: String,
        #[serde(default)]
        usage: Usage,
    },
    /// Answer to a non-streaming `chat`.
    ChatCompletion {
        message: ChatMessage,
        #[serde(default)]
        usage: Usage,
    },
    StreamStart,
    StreamToken {
        token: String,
    },
    StreamEnd,
    /// Load, decode, or generation failure.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    UnloadSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Advisory notice that the worker is terminating on a signal.
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ResponseMessage {
    /// Wire tag of this response.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseMessage::Loading { .. } => "loading",
            ResponseMessage::Ready { .. } => "ready",
            ResponseMessage::Completion { .. } => "completion",
            ResponseMessage::ChatCompletion { .. } => "chat_completion",
            ResponseMessage::StreamStart => "stream_start",
            ResponseMessage::StreamToken { .. } => "stream_token",
            ResponseMessage::StreamEnd => "stream_end",
            ResponseMessage::Error { .. } => "error",
            ResponseMessage::Pong { .. } => "pong",
            ResponseMessage::UnloadSuccess { .. } => "unload_success",
            ResponseMessage::Shutdown { .. } => "shutdown",
        }
    }

    pub fn error(error: impl Into<String>, traceback: Option<String>) -> Self {
        ResponseMessage::Error {
            error: error.into(),
            traceback,
        }
    }
}

/// A response line: the echoed request id (absent for unsolicited messages)
/// plus the tagged message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub message: ResponseMessage,
}

impl ResponseEnvelope {
    pub fn new(id: Option<RequestId>, message: ResponseMessage) -> Self {
        Self { id, message }
    }

    /// A message not tied to any request (`loading`, `ready`, `shutdown`).
    pub fn unsolicited(message: ResponseMessage) -> Self {
        Self { id: None, message }
    }
}

/// Why a request line could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("request is not a JSON object")]
    NotAnObject,
    #[error("request has no string `type` field")]
    MissingType,
    #[error("unknown request type: {0}")]
    UnknownType(String),
    #[error("invalid `{kind}` request: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode failure, carrying the request id when one could be recovered.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct RequestDecodeError {
    pub id: Option<RequestId>,
    #[source]
    pub kind: DecodeErrorKind,
}

impl RequestDecodeError {
    fn new(id: Option<RequestId>, kind: DecodeErrorKind) -> Self {
        Self { id, kind }
    }
}

/// Decode one request line in two passes: sniff `type` from an untyped value,
/// then decode the typed payload.
pub fn decode_request(line: &str) -> Result<RequestEnvelope, RequestDecodeError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RequestDecodeError::new(None, DecodeErrorKind::Json(e)))?;

    let Some(map) = value.as_object() else {
        return Err(RequestDecodeError::new(None, DecodeErrorKind::NotAnObject));
    };
    let id = map.get("id").and_then(Value::as_u64);

    let kind = match map.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(RequestDecodeError::new(id, DecodeErrorKind::MissingType)),
    };
    if !REQUEST_TYPES.contains(&kind.as_str()) {
        return Err(RequestDecodeError::new(id, DecodeErrorKind::UnknownType(kind)));
    }

    serde_json::from_value(value).map_err(|source| {
        RequestDecodeError::new(id, DecodeErrorKind::InvalidFields { kind, source })
    })
}

/// Decode one response line.
pub fn decode_response(line: &str) -> serde_json::Result<ResponseEnvelope> {
    serde_json::from_str(line)
}

/// Serialize a message as a single protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
