//! WebSocket message types and parsers for the local workflow server.
//!
//! The server sends JSON text frames with the shape
//! `{"type": "<kind>", "data": {...}}`, deserialized here into a
//! strongly-typed [`ComfyMessage`] enum, plus binary frames carrying
//! preview images with an 8-byte header.

use serde::Deserialize;

/// All known WebSocket message types.
///
/// Deserialized via the internally-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyMessage {
    /// Server status broadcast (queue depth, etc.). Not job-specific.
    #[serde(rename = "status")]
    Status(serde_json::Value),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is executing, or the whole graph completed when
    /// `node` is `None`.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress from a long-running node (e.g. a sampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution was interrupted (queue delete or interrupt call).
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),
}

impl ComfyMessage {
    /// Job id embedded in the message, when the message is job-scoped.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyMessage::Status(_) => None,
            ComfyMessage::ExecutionStart(d) => Some(&d.prompt_id),
            ComfyMessage::ExecutionCached(d) => Some(&d.prompt_id),
            ComfyMessage::Executing(d) => Some(&d.prompt_id),
            ComfyMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyMessage::Executed(d) => Some(&d.prompt_id),
            ComfyMessage::ExecutionError(d) => Some(&d.prompt_id),
            ComfyMessage::ExecutionInterrupted(d) => Some(&d.prompt_id),
        }
    }
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: u32,
    /// Total number of steps.
    pub max: u32,
    /// Some server versions omit the prompt id on progress frames.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// Raw output value; image descriptors live under `output.images`.
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
}

/// Parse a WebSocket text frame into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// Binary frames
// ---------------------------------------------------------------------------

/// Binary frame event code for preview images.
pub const BINARY_EVENT_PREVIEW: u32 = 1;

/// Decoded header of a binary WebSocket frame.
///
/// Layout: 4 bytes big-endian event code, 4 bytes big-endian format
/// code, remainder is the payload. Only the preview event is
/// recognized; its payload is intentionally discarded -- previews are
/// never persisted, only final results are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryFrame {
    pub event: u32,
    pub format: u32,
    pub payload_len: usize,
}

impl BinaryFrame {
    pub fn is_preview(&self) -> bool {
        self.event == BINARY_EVENT_PREVIEW
    }
}

/// Decode the 8-byte header of a binary frame. Returns `None` for
/// frames too short to carry a header.
pub fn decode_binary_frame(data: &[u8]) -> Option<BinaryFrame> {
    if data.len() < 8 {
        return None;
    }
    let event = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let format = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Some(BinaryFrame {
        event,
        format,
        payload_len: data.len() - 8,
    })
}
