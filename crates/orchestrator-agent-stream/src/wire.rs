use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broadcast::ConsumerFinishCallback;
use crate::content::Source;
use crate::errors::StreamError;
use crate::stream::StreamEvent;

/// One chunk of the UI message stream protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WireChunk {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    StartStep,
    TextStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    TextDelta {
        id: String,
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    TextEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    ReasoningStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    ReasoningDelta {
        id: String,
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    ReasoningEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    SourceUrl {
        source_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    SourceDocument {
        source_id: String,
        media_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    File {
        url: String,
        media_type: String,
    },
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
    },
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
    },
    ToolInputError {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        error_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preliminary: Option<bool>,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
    },
    ToolApprovalRequest {
        approval_id: String,
        tool_call_id: String,
    },
    ToolOutputDenied {
        tool_call_id: String,
    },
    FinishStep,
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    Abort,
    Error {
        error_text: String,
    },
    MessageMetadata {
        message_metadata: Value,
    },
}

pub type MessageMetadataFn = Arc<dyn Fn(&StreamEvent) -> Option<Value> + Send + Sync>;
pub type ErrorFormatter = Arc<dyn Fn(&StreamError) -> String + Send + Sync>;

/// Message sent in place of error details unless a formatter is configured.
pub const MASKED_ERROR_TEXT: &str = "An error occurred.";

/// Options for the wire-protocol projection.
#[derive(Clone)]
pub struct WireStreamOptions {
    pub send_reasoning: bool,
    pub send_sources: bool,
    pub send_start: bool,
    pub send_finish: bool,
    pub message_id: Option<String>,
    pub message_metadata: Option<MessageMetadataFn>,
    pub on_error: ErrorFormatter,
    pub on_finish: Option<ConsumerFinishCallback>,
}

impl Default for WireStreamOptions {
    fn default() -> Self {
        Self {
            send_reasoning: true,
            send_sources: false,
            send_start: true,
            send_finish: true,
            message_id: None,
            message_metadata: None,
            on_error: Arc::new(|_: &StreamError| MASKED_ERROR_TEXT.to_string()),
            on_finish: None,
        }
    }
}

impl WireStreamOptions {
    pub fn send_reasoning(mut self, send: bool) -> Self {
        self.send_reasoning = send;
        self
    }

    pub fn send_sources(mut self, send: bool) -> Self {
        self.send_sources = send;
        self
    }

    pub fn send_start(mut self, send: bool) -> Self {
        self.send_start = send;
        self
    }

    pub fn send_finish(mut self, send: bool) -> Self {
        self.send_finish = send;
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn message_metadata(
        mut self,
        f: impl Fn(&StreamEvent) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.message_metadata = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&StreamError) -> String + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(f);
        self
    }

    pub fn on_finish(
        mut self,
        f: impl Fn(crate::broadcast::ConsumerFinish) + Send + Sync + 'static,
    ) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }
}

fn flag(value: bool) -> Option<bool> {
    value.then_some(true)
}

/// Maps canonical events to wire chunks.
pub struct WireEncoder {
    options: WireStreamOptions,
}

impl WireEncoder {
    pub fn new(options: WireStreamOptions) -> Self {
        Self { options }
    }

    fn metadata(&self, event: &StreamEvent) -> Option<Value> {
        self.options
            .message_metadata
            .as_ref()
            .and_then(|f| f(event))
    }

    pub fn encode(&self, event: &StreamEvent) -> Vec<WireChunk> {
        let options = &self.options;
        let mut chunks = Vec::new();
        match event {
            StreamEvent::Start => {
                if options.send_start {
                    chunks.push(WireChunk::Start {
                        message_id: options.message_id.clone(),
                        message_metadata: self.metadata(event),
                    });
                }
                return chunks;
            }
            StreamEvent::Finish { .. } => {
                if options.send_finish {
                    chunks.push(WireChunk::Finish {
                        message_metadata: self.metadata(event),
                    });
                }
                return chunks;
            }
            StreamEvent::StartStep { .. } => chunks.push(WireChunk::StartStep),
            StreamEvent::FinishStep { .. } => chunks.push(WireChunk::FinishStep),
            StreamEvent::Abort => chunks.push(WireChunk::Abort),
            StreamEvent::Error { error } => chunks.push(WireChunk::Error {
                error_text: (options.on_error)(error),
            }),
            StreamEvent::TextStart {
                id,
                provider_metadata,
            } => chunks.push(WireChunk::TextStart {
                id: id.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::TextDelta {
                id,
                text,
                provider_metadata,
            } => chunks.push(WireChunk::TextDelta {
                id: id.clone(),
                delta: text.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::TextEnd {
                id,
                provider_metadata,
            } => chunks.push(WireChunk::TextEnd {
                id: id.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::ReasoningStart {
                id,
                provider_metadata,
            } if options.send_reasoning => chunks.push(WireChunk::ReasoningStart {
                id: id.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::ReasoningDelta {
                id,
                text,
                provider_metadata,
            } if options.send_reasoning => chunks.push(WireChunk::ReasoningDelta {
                id: id.clone(),
                delta: text.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::ReasoningEnd {
                id,
                provider_metadata,
            } if options.send_reasoning => chunks.push(WireChunk::ReasoningEnd {
                id: id.clone(),
                provider_metadata: provider_metadata.clone(),
            }),
            StreamEvent::Source(source) if options.send_sources => match source {
                Source::Url {
                    id,
                    url,
                    title,
                    provider_metadata,
                } => chunks.push(WireChunk::SourceUrl {
                    source_id: id.clone(),
                    url: url.clone(),
                    title: title.clone(),
                    provider_metadata: provider_metadata.clone(),
                }),
                Source::Document {
                    id,
                    media_type,
                    title,
                    filename,
                    provider_metadata,
                } => chunks.push(WireChunk::SourceDocument {
                    source_id: id.clone(),
                    media_type: media_type.clone(),
                    title: title.clone(),
                    filename: filename.clone(),
                    provider_metadata: provider_metadata.clone(),
                }),
            },
            StreamEvent::File(file) => chunks.push(WireChunk::File {
                url: file.data_url(),
                media_type: file.media_type.clone(),
            }),
            StreamEvent::ToolInputStart {
                id,
                tool_name,
                dynamic,
                provider_executed,
            } => chunks.push(WireChunk::ToolInputStart {
                tool_call_id: id.clone(),
                tool_name: tool_name.clone(),
                provider_executed: flag(*provider_executed),
                dynamic: flag(*dynamic),
            }),
            StreamEvent::ToolInputDelta { id, delta } => chunks.push(WireChunk::ToolInputDelta {
                tool_call_id: id.clone(),
                input_text_delta: delta.clone(),
            }),
            StreamEvent::ToolCall(call) => match &call.error {
                Some(error) if call.invalid => chunks.push(WireChunk::ToolInputError {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    input: call.input.clone(),
                    error_text: (options.on_error)(&StreamError::Tool(error.clone())),
                    provider_executed: flag(call.provider_executed),
                    provider_metadata: call.provider_metadata.clone(),
                    dynamic: flag(call.dynamic),
                }),
                _ => chunks.push(WireChunk::ToolInputAvailable {
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    input: call.input.clone(),
                    provider_executed: flag(call.provider_executed),
                    provider_metadata: call.provider_metadata.clone(),
                    dynamic: flag(call.dynamic),
                }),
            },
            StreamEvent::ToolResult(result) => chunks.push(WireChunk::ToolOutputAvailable {
                tool_call_id: result.tool_call_id.clone(),
                output: result.output.clone(),
                provider_executed: flag(result.provider_executed),
                dynamic: flag(result.dynamic),
                preliminary: flag(result.preliminary),
            }),
            StreamEvent::ToolError(failure) => chunks.push(WireChunk::ToolOutputError {
                tool_call_id: failure.tool_call_id.clone(),
                error_text: (options.on_error)(&StreamError::Tool(failure.error.clone())),
                provider_executed: flag(failure.provider_executed),
                dynamic: flag(failure.dynamic),
            }),
            StreamEvent::ToolApprovalRequest(request) => {
                chunks.push(WireChunk::ToolApprovalRequest {
                    approval_id: request.approval_id.clone(),
                    tool_call_id: request.tool_call.tool_call_id.clone(),
                })
            }
            StreamEvent::ToolOutputDenied { tool_call_id, .. } => {
                chunks.push(WireChunk::ToolOutputDenied {
                    tool_call_id: tool_call_id.clone(),
                })
            }
            _ => {}
        }
        if let Some(message_metadata) = self.metadata(event) {
            chunks.push(WireChunk::MessageMetadata { message_metadata });
        }
        chunks
    }
}

/// Sentinel frame that ends an SSE body.
pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Encodes a chunk as one `data:` frame.
pub fn sse_frame(chunk: &WireChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize wire chunk");
            Bytes::from(format!(
                "data: {{\"type\":\"error\",\"errorText\":\"{MASKED_ERROR_TEXT}\"}}\n\n"
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parses the frame payload; `None` for the `[DONE]` sentinel.
    pub fn chunk(&self) -> Result<Option<WireChunk>, serde_json::Error> {
        if self.is_done() {
            return Ok(None);
        }
        serde_json::from_str(&self.data).map(Some)
    }
}

/// Incremental reader for SSE bodies, tolerant of arbitrary chunk boundaries.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        if buf[i..].starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if buf[i..].starts_with(b"\n\n") {
            Some((i, 2))
        } else {
            None
        }
    })
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.split('\n').map(|line| line.trim_end_matches('\r')) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}
