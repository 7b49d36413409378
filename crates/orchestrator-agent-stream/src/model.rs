use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::content::{GeneratedFile, Source};
use crate::errors::ModelError;
use crate::message::ModelMessage;
use crate::usage::{FinishReason, Usage};

/// Stable identifier for a provider implementation (for example `openai`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Generation settings forwarded untouched to the model.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// How the model may pick tools.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Tool {
        #[serde(rename = "toolName")]
        tool_name: String,
    },
}

/// Tool description sent to the model.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default)]
    pub provider_executed: bool,
}

/// Everything a model needs for one call.
#[derive(Clone, Debug)]
pub struct ModelCallRequest {
    pub run_id: uuid::Uuid,
    pub step_number: usize,
    pub system: Option<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub settings: CallSettings,
    /// JSON schema the response text should follow; `None` for free text.
    pub response_format: Option<Value>,
    pub include_raw_chunks: bool,
    /// Fires when the run is cancelled; implementations should stop reading promptly.
    pub cancellation: CancellationToken,
}

/// Raw events produced by a model call, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    StreamStart {
        warnings: Vec<String>,
    },
    ResponseMetadata {
        id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        model_id: Option<String>,
    },
    TextStart {
        id: String,
        provider_metadata: Option<Value>,
    },
    TextDelta {
        id: String,
        delta: String,
        provider_metadata: Option<Value>,
    },
    TextEnd {
        id: String,
        provider_metadata: Option<Value>,
    },
    ReasoningStart {
        id: String,
        provider_metadata: Option<Value>,
    },
    ReasoningDelta {
        id: String,
        delta: String,
        provider_metadata: Option<Value>,
    },
    ReasoningEnd {
        id: String,
        provider_metadata: Option<Value>,
    },
    ToolInputStart {
        id: String,
        tool_name: String,
        provider_executed: bool,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    /// A complete call; `input` is the raw JSON text the model produced.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: String,
        provider_executed: bool,
        provider_metadata: Option<Value>,
    },
    /// Result of a provider-executed tool.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
    },
    Source(Source),
    File(GeneratedFile),
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
        provider_metadata: Option<Value>,
    },
    /// Error chunk inside an otherwise healthy stream.
    Error {
        error: Value,
    },
    /// Provider-native chunk, forwarded only when raw chunks are requested.
    Raw {
        value: Value,
    },
}

pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, ModelError>> + Send>>;

/// Metadata about an established model call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponseMeta {
    /// Request body as sent to the provider, if the model exposes it.
    pub request_body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

/// An established model call.
pub struct ModelStreamHandle {
    pub stream: RawEventStream,
    pub metadata: ModelResponseMeta,
}

/// A language model that produces raw event streams.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn model_id(&self) -> String;

    /// Establishes a streaming call. Errors returned here may be retried.
    async fn do_stream(&self, request: ModelCallRequest) -> Result<ModelStreamHandle, ModelError>;
}
