use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::content::{
    ContentPart, GeneratedFile, Source, ToolApprovalRequest, ToolCall, ToolFailure, ToolResult,
};
use crate::message::ModelMessage;
use crate::usage::{FinishReason, Usage};

/// What was sent to the model for a step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepRequest {
    pub body: Option<Value>,
}

/// Response metadata for a step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResponse {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub headers: BTreeMap<String, String>,
}

/// The immutable record of one completed step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub step_number: usize,
    pub content: Vec<ContentPart>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub warnings: Vec<String>,
    pub request: StepRequest,
    pub response: StepResponse,
    pub provider_metadata: Option<Value>,
    /// Messages this step contributed to the conversation history.
    pub response_messages: Vec<ModelMessage>,
}

impl StepResult {
    pub fn text(&self) -> String {
        crate::content::text_of(&self.content)
    }

    pub fn reasoning(&self) -> Vec<ContentPart> {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::Reasoning { .. }))
            .cloned()
            .collect()
    }

    /// Concatenated reasoning text, `None` when the step produced no reasoning.
    pub fn reasoning_text(&self) -> Option<String> {
        let mut seen = false;
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Reasoning { text, .. } = part {
                seen = true;
                out.push_str(text);
            }
        }
        seen.then_some(out)
    }

    pub fn sources(&self) -> Vec<Source> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Source(source) => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn files(&self) -> Vec<GeneratedFile> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::File(file) => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    /// Final tool results; preliminary ones are left out.
    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(result) if !result.preliminary => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_errors(&self) -> Vec<ToolFailure> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolError(failure) => Some(failure.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn approval_requests(&self) -> Vec<ToolApprovalRequest> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolApprovalRequest(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }
}
