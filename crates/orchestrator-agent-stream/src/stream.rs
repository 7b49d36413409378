use serde_json::Value;

use crate::content::{GeneratedFile, Source, ToolApprovalRequest, ToolCall, ToolFailure, ToolResult};
use crate::errors::StreamError;
use crate::step::{StepRequest, StepResponse};
use crate::usage::{FinishReason, Usage};

/// Canonical events of one run, as delivered to every consumer.
///
/// A run always starts with `Start` and ends in exactly one of `Finish`,
/// `Abort`, or a terminal `Error`. Every `StartStep` is matched by a
/// `FinishStep` unless the run is aborted or fails mid-step.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Start,
    StartStep {
        request: StepRequest,
        warnings: Vec<String>,
    },
    TextStart {
        id: String,
        provider_metadata: Option<Value>,
    },
    TextDelta {
        id: String,
        text: String,
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
        text: String,
        provider_metadata: Option<Value>,
    },
    ReasoningEnd {
        id: String,
        provider_metadata: Option<Value>,
    },
    Source(Source),
    File(GeneratedFile),
    ToolInputStart {
        id: String,
        tool_name: String,
        dynamic: bool,
        provider_executed: bool,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    ToolError(ToolFailure),
    ToolApprovalRequest(ToolApprovalRequest),
    /// The user denied a call that required approval.
    ToolOutputDenied {
        tool_call_id: String,
        tool_name: String,
        reason: Option<String>,
    },
    FinishStep {
        response: StepResponse,
        usage: Usage,
        finish_reason: FinishReason,
        provider_metadata: Option<Value>,
    },
    Finish {
        finish_reason: FinishReason,
        total_usage: Usage,
    },
    Abort,
    Error {
        error: StreamError,
    },
    Raw {
        value: Value,
    },
}

impl StreamEvent {
    /// `Finish` and `Abort` end a consumer's stream and trigger its finish callback.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Abort)
    }

    /// Events that are forwarded to the `on_chunk` callback.
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. }
                | Self::ReasoningDelta { .. }
                | Self::Source(_)
                | Self::ToolCall(_)
                | Self::ToolInputStart { .. }
                | Self::ToolInputDelta { .. }
                | Self::ToolResult(_)
                | Self::Raw { .. }
        )
    }

    /// Short kebab-case name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StartStep { .. } => "start-step",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::Source(_) => "source",
            Self::File(_) => "file",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputEnd { .. } => "tool-input-end",
            Self::ToolCall(_) => "tool-call",
            Self::ToolResult(_) => "tool-result",
            Self::ToolError(_) => "tool-error",
            Self::ToolApprovalRequest(_) => "tool-approval-request",
            Self::ToolOutputDenied { .. } => "tool-output-denied",
            Self::FinishStep { .. } => "finish-step",
            Self::Finish { .. } => "finish",
            Self::Abort => "abort",
            Self::Error { .. } => "error",
            Self::Raw { .. } => "raw",
        }
    }
}
