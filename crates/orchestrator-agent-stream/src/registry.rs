use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use crate::content::{ContentPart, GeneratedFile, Source, ToolCall, ToolResult};
use crate::errors::ResultError;
use crate::message::ModelMessage;
use crate::step::StepResult;
use crate::usage::{FinishReason, Usage};

/// Response metadata of the final step plus the messages of every step.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseTranscript {
    pub id: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
    pub messages: Vec<ModelMessage>,
}

/// Everything a finished run resolved to.
///
/// Per-step values (`text`, `tool_calls`, `usage`, ...) describe the final
/// step; `steps` and `total_usage` cover the whole run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    final_step: StepResult,
    steps: Vec<StepResult>,
    total_usage: Usage,
    response: ResponseTranscript,
}

impl RunOutcome {
    /// `None` when no step completed.
    pub fn from_steps(steps: Vec<StepResult>, messages: Vec<ModelMessage>) -> Option<Self> {
        let final_step = steps.last()?.clone();
        let total_usage = steps.iter().map(|step| step.usage).sum();
        let response = ResponseTranscript {
            id: final_step.response.id.clone(),
            model_id: final_step.response.model_id.clone(),
            timestamp: final_step.response.timestamp,
            headers: final_step.response.headers.clone(),
            messages,
        };
        Some(Self {
            final_step,
            steps,
            total_usage,
            response,
        })
    }

    pub fn final_step(&self) -> &StepResult {
        &self.final_step
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn text(&self) -> String {
        self.final_step.text()
    }

    pub fn reasoning(&self) -> Vec<ContentPart> {
        self.final_step.reasoning()
    }

    pub fn reasoning_text(&self) -> Option<String> {
        self.final_step.reasoning_text()
    }

    pub fn sources(&self) -> Vec<Source> {
        self.final_step.sources()
    }

    pub fn files(&self) -> Vec<GeneratedFile> {
        self.final_step.files()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.final_step.tool_calls()
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.final_step.tool_results()
    }

    pub fn content(&self) -> &[ContentPart] {
        &self.final_step.content
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.final_step.finish_reason
    }

    /// Usage of the final step.
    pub fn usage(&self) -> Usage {
        self.final_step.usage
    }

    pub fn total_usage(&self) -> Usage {
        self.total_usage
    }

    pub fn provider_metadata(&self) -> Option<&Value> {
        self.final_step.provider_metadata.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.final_step.warnings
    }

    pub fn response(&self) -> &ResponseTranscript {
        &self.response
    }
}

type Slot<T> = Option<Result<T, ResultError>>;

/// Write side of a result handle. Fulfilled at most once; dropping it
/// unfulfilled rejects every reader with `ResultError::Aborted`.
pub(crate) struct ResultSlot<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone> ResultSlot<T> {
    pub fn new() -> (Self, ResultHandle<T>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, ResultHandle { rx })
    }

    /// Returns false when the slot already held a value.
    pub fn fulfill(&self, value: Result<T, ResultError>) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }
}

/// Read side of a once-resolved value. Clones share the same slot.
#[derive(Clone, Debug)]
pub struct ResultHandle<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone> ResultHandle<T> {
    /// Waits until the run resolves or rejects the value.
    pub async fn get(&self) -> Result<T, ResultError> {
        let mut rx = self.rx.clone();
        // A closed channel still exposes the last value written.
        let _ = rx.wait_for(Option::is_some).await;
        let resolved = rx.borrow().clone();
        resolved.unwrap_or(Err(ResultError::Aborted))
    }

    /// The value if it has already been resolved.
    pub fn try_get(&self) -> Option<Result<T, ResultError>> {
        self.rx.borrow().clone()
    }
}
