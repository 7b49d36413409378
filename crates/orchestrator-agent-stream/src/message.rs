use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::ContentPart;
use crate::errors::ToolError;

/// A message in the conversation history sent to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ModelMessage {
    System { content: String },
    User { content: Vec<UserPart> },
    Assistant { content: Vec<AssistantPart> },
    Tool { content: Vec<ToolMessagePart> },
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![UserPart::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![AssistantPart::Text {
                text: text.into(),
                provider_options: None,
            }],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum UserPart {
    Text { text: String },
    File { media_type: String, data: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AssistantPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_options: Option<Value>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_options: Option<Value>,
    },
    File {
        media_type: String,
        data: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
    },
    /// Result of a provider-executed tool; it belongs to the assistant turn.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: ToolResultOutput,
    },
    ToolApprovalRequest {
        approval_id: String,
        tool_call_id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ToolMessagePart {
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: ToolResultOutput,
    },
    ToolApprovalResponse {
        approval_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Tool output in the shape the model expects on the next call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ToolResultOutput {
    Text(String),
    Json(Value),
    ErrorText(String),
    ErrorJson(Value),
    ExecutionDenied(Option<String>),
}

impl ToolResultOutput {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text.clone()),
            other => Self::Json(other.clone()),
        }
    }

    pub fn from_error(error: &ToolError) -> Self {
        match error {
            ToolError::Execution {
                details: Some(details),
                ..
            } => Self::ErrorJson(details.clone()),
            other => Self::ErrorText(other.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ErrorText(_) | Self::ErrorJson(_) | Self::ExecutionDenied(_)
        )
    }
}

/// Converts one step's content into the messages appended to the history for
/// the next model call: an assistant message followed by a tool message, each
/// only when non-empty.
pub fn to_response_messages(content: &[ContentPart]) -> Vec<ModelMessage> {
    let mut assistant = Vec::new();
    let mut tool = Vec::new();

    for part in content {
        match part {
            ContentPart::Text {
                text,
                provider_metadata,
            } => {
                if !text.is_empty() {
                    assistant.push(AssistantPart::Text {
                        text: text.clone(),
                        provider_options: provider_metadata.clone(),
                    });
                }
            }
            ContentPart::Reasoning {
                text,
                provider_metadata,
            } => assistant.push(AssistantPart::Reasoning {
                text: text.clone(),
                provider_options: provider_metadata.clone(),
            }),
            ContentPart::File(file) => assistant.push(AssistantPart::File {
                media_type: file.media_type.clone(),
                data: file.base64.clone(),
            }),
            ContentPart::ToolCall(call) => assistant.push(AssistantPart::ToolCall {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: call.input.clone(),
                provider_executed: call.provider_executed.then_some(true),
            }),
            ContentPart::ToolResult(result) if !result.preliminary => {
                let output = ToolResultOutput::from_value(&result.output);
                if result.provider_executed {
                    assistant.push(AssistantPart::ToolResult {
                        tool_call_id: result.tool_call_id.clone(),
                        tool_name: result.tool_name.clone(),
                        output,
                    });
                } else {
                    tool.push(ToolMessagePart::ToolResult {
                        tool_call_id: result.tool_call_id.clone(),
                        tool_name: result.tool_name.clone(),
                        output,
                    });
                }
            }
            ContentPart::ToolError(failure) => {
                let output = ToolResultOutput::from_error(&failure.error);
                if failure.provider_executed {
                    assistant.push(AssistantPart::ToolResult {
                        tool_call_id: failure.tool_call_id.clone(),
                        tool_name: failure.tool_name.clone(),
                        output,
                    });
                } else {
                    tool.push(ToolMessagePart::ToolResult {
                        tool_call_id: failure.tool_call_id.clone(),
                        tool_name: failure.tool_name.clone(),
                        output,
                    });
                }
            }
            ContentPart::ToolApprovalRequest(request) => {
                assistant.push(AssistantPart::ToolApprovalRequest {
                    approval_id: request.approval_id.clone(),
                    tool_call_id: request.tool_call.tool_call_id.clone(),
                })
            }
            ContentPart::ToolResult(_) | ContentPart::Source(_) => {}
        }
    }

    let mut messages = Vec::new();
    if !assistant.is_empty() {
        messages.push(ModelMessage::Assistant { content: assistant });
    }
    if !tool.is_empty() {
        messages.push(ModelMessage::Tool { content: tool });
    }
    messages
}
