use crate::assembler::{ContentAssembler, LifecycleError, PartKind};
use crate::content::ContentPart;
use crate::errors::StreamError;
use crate::message::{ModelMessage, ToolMessagePart, ToolResultOutput, to_response_messages};
use crate::step::{StepRequest, StepResult};
use crate::stream::StreamEvent;
use crate::usage::Usage;

/// What the recorder derived from one event.
#[derive(Debug, Default)]
pub struct Observation {
    /// Set when the event completed a step.
    pub step: Option<StepResult>,
    /// Error event to publish after the observed one.
    pub error: Option<StreamEvent>,
}

/// Point-in-time view of everything recorded so far.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranscriptSnapshot {
    pub steps: Vec<StepResult>,
    /// Assistant/tool messages of all completed steps.
    pub messages: Vec<ModelMessage>,
    /// Content of the step in progress.
    pub partial_content: Vec<ContentPart>,
}

/// Builds step results from the canonical (post-transform) event stream.
///
/// Tool outputs that arrive outside a step (approvals resolved before the
/// first model call) are folded into a tool message at the next step start.
#[derive(Debug, Default)]
pub struct StepRecorder {
    assembler: ContentAssembler,
    steps: Vec<StepResult>,
    response_messages: Vec<ModelMessage>,
    pending_tool_parts: Vec<ToolMessagePart>,
    step_open: bool,
    request: StepRequest,
    warnings: Vec<String>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) -> Observation {
        let mut observation = Observation::default();
        let lifecycle = match event {
            StreamEvent::StartStep { request, warnings } => {
                self.flush_pending_tool_parts();
                self.step_open = true;
                self.request = request.clone();
                self.warnings = warnings.clone();
                Ok(())
            }
            StreamEvent::TextStart {
                id,
                provider_metadata,
            } => self
                .assembler
                .start(PartKind::Text, id, provider_metadata.clone()),
            StreamEvent::TextDelta {
                id,
                text,
                provider_metadata,
            } => self
                .assembler
                .delta(PartKind::Text, id, text, provider_metadata.clone()),
            StreamEvent::TextEnd {
                id,
                provider_metadata,
            } => self
                .assembler
                .end(PartKind::Text, id, provider_metadata.clone()),
            StreamEvent::ReasoningStart {
                id,
                provider_metadata,
            } => self
                .assembler
                .start(PartKind::Reasoning, id, provider_metadata.clone()),
            StreamEvent::ReasoningDelta {
                id,
                text,
                provider_metadata,
            } => self
                .assembler
                .delta(PartKind::Reasoning, id, text, provider_metadata.clone()),
            StreamEvent::ReasoningEnd {
                id,
                provider_metadata,
            } => self
                .assembler
                .end(PartKind::Reasoning, id, provider_metadata.clone()),
            StreamEvent::Source(source) => {
                self.assembler.push(ContentPart::Source(source.clone()));
                Ok(())
            }
            StreamEvent::File(file) => {
                self.assembler.push(ContentPart::File(file.clone()));
                Ok(())
            }
            StreamEvent::ToolCall(call) => {
                self.assembler.push(ContentPart::ToolCall(call.clone()));
                Ok(())
            }
            StreamEvent::ToolResult(result) if !result.preliminary => {
                if self.step_open {
                    self.assembler.push(ContentPart::ToolResult(result.clone()));
                } else {
                    self.pending_tool_parts.push(ToolMessagePart::ToolResult {
                        tool_call_id: result.tool_call_id.clone(),
                        tool_name: result.tool_name.clone(),
                        output: ToolResultOutput::from_value(&result.output),
                    });
                }
                Ok(())
            }
            StreamEvent::ToolError(failure) => {
                if self.step_open {
                    self.assembler.push(ContentPart::ToolError(failure.clone()));
                } else {
                    self.pending_tool_parts.push(ToolMessagePart::ToolResult {
                        tool_call_id: failure.tool_call_id.clone(),
                        tool_name: failure.tool_name.clone(),
                        output: ToolResultOutput::from_error(&failure.error),
                    });
                }
                Ok(())
            }
            StreamEvent::ToolApprovalRequest(request) => {
                self.assembler
                    .push(ContentPart::ToolApprovalRequest(request.clone()));
                Ok(())
            }
            StreamEvent::ToolOutputDenied {
                tool_call_id,
                tool_name,
                reason,
            } => {
                self.pending_tool_parts.push(ToolMessagePart::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    output: ToolResultOutput::ExecutionDenied(reason.clone()),
                });
                Ok(())
            }
            StreamEvent::FinishStep {
                response,
                usage,
                finish_reason,
                provider_metadata,
            } => {
                let content = self.assembler.finish_step();
                let response_messages = to_response_messages(&content);
                self.response_messages.extend(response_messages.iter().cloned());
                let step = StepResult {
                    step_number: self.steps.len(),
                    content,
                    finish_reason: *finish_reason,
                    usage: *usage,
                    warnings: std::mem::take(&mut self.warnings),
                    request: std::mem::take(&mut self.request),
                    response: response.clone(),
                    provider_metadata: provider_metadata.clone(),
                    response_messages,
                };
                self.steps.push(step.clone());
                self.step_open = false;
                observation.step = Some(step);
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(err) = lifecycle {
            observation.error = Some(lifecycle_error_event(&err));
        }
        observation
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn last_step(&self) -> Option<&StepResult> {
        self.steps.last()
    }

    /// Messages to append to the caller's history for the next model call.
    pub fn response_messages(&self) -> &[ModelMessage] {
        &self.response_messages
    }

    /// Folds tool outputs recorded outside a step into the history.
    pub fn flush_pending_tool_parts(&mut self) {
        if self.pending_tool_parts.is_empty() {
            return;
        }
        self.response_messages.push(ModelMessage::Tool {
            content: std::mem::take(&mut self.pending_tool_parts),
        });
    }

    pub fn total_usage(&self) -> Usage {
        self.steps.iter().map(|step| step.usage).sum()
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            steps: self.steps.clone(),
            messages: self.response_messages.clone(),
            partial_content: self.assembler.parts().to_vec(),
        }
    }
}

fn lifecycle_error_event(err: &LifecycleError) -> StreamEvent {
    StreamEvent::Error {
        error: StreamError::Protocol(err.to_string()),
    }
}
