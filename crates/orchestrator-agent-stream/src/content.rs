use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::errors::ToolError;

/// A unit of assembled step content.
///
/// Parts keep the order in which their first event arrived.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ContentPart {
    /// Text assembled from a `text-start`/`text-delta`/`text-end` lifecycle.
    Text {
        text: String,
        provider_metadata: Option<Value>,
    },
    /// Reasoning assembled from a reasoning lifecycle.
    Reasoning {
        text: String,
        provider_metadata: Option<Value>,
    },
    Source(Source),
    File(GeneratedFile),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    ToolError(ToolFailure),
    ToolApprovalRequest(ToolApprovalRequest),
}

impl ContentPart {
    /// Returns the text for text parts.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// Concatenates the text parts in order and ignores everything else.
pub fn text_of(parts: &[ContentPart]) -> String {
    parts.iter().filter_map(ContentPart::as_text).collect()
}

/// A request by the model to invoke a named tool.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Parsed input. For invalid calls whose input could not be parsed this is the raw text.
    pub input: Value,
    /// True when the tool is unknown to the static tool set or registered as dynamic.
    pub dynamic: bool,
    pub provider_executed: bool,
    /// Set when parsing or validation failed; such calls are never executed.
    pub invalid: bool,
    pub error: Option<ToolError>,
    pub provider_metadata: Option<Value>,
}

/// Output of a tool call.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub output: Value,
    pub dynamic: bool,
    pub provider_executed: bool,
    /// Intermediate output from an incremental executor; superseded by the final one.
    pub preliminary: bool,
}

/// Failure of a tool call.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolFailure {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub error: ToolError,
    pub dynamic: bool,
    pub provider_executed: bool,
}

/// Marker that a call is suspended until the user approves or denies it.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolApprovalRequest {
    pub approval_id: String,
    pub tool_call: ToolCall,
}

/// A citation surfaced by the model.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "sourceType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Source {
    Url {
        id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
    Document {
        id: String,
        media_type: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Value>,
    },
}

impl Source {
    pub fn id(&self) -> &str {
        match self {
            Self::Url { id, .. } | Self::Document { id, .. } => id,
        }
    }
}

/// A file generated by the model, held as base64 text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub media_type: String,
    pub base64: String,
}

impl GeneratedFile {
    pub fn new(media_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            base64: base64.into(),
        }
    }

    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(media_type, STANDARD.encode(bytes))
    }

    /// Decodes the file contents.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.base64)
    }

    /// `data:` URL used by the wire protocol.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.base64)
    }
}
