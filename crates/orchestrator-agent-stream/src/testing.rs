//! Scripted model for tests and demos.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::{StreamExt as _, stream};
use serde_json::Value;

use crate::broadcast::lock;
use crate::errors::ModelError;
use crate::model::{
    LanguageModel, ModelCallRequest, ModelResponseMeta, ModelStreamHandle, ProviderId, RawEvent,
};
use crate::usage::{FinishReason, Usage};

/// What the mock does for one model call.
#[derive(Clone, Debug)]
pub enum MockStep {
    /// Yields the items, then ends.
    Events(Vec<Result<RawEvent, ModelError>>),
    /// Yields the events, then waits for cancellation and fails with `Cancelled`.
    Pending(Vec<RawEvent>),
    /// The call itself fails.
    CallError(ModelError),
}

impl MockStep {
    pub fn events(events: Vec<RawEvent>) -> Self {
        Self::Events(events.into_iter().map(Ok).collect())
    }
}

/// A [`LanguageModel`] that replays one script per call and records every request.
pub struct MockLanguageModel {
    model_id: String,
    metadata: ModelResponseMeta,
    script: Mutex<VecDeque<MockStep>>,
    calls: Mutex<Vec<ModelCallRequest>>,
}

impl MockLanguageModel {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            model_id: "mock-model-id".to_string(),
            metadata: ModelResponseMeta::default(),
            script: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: ModelResponseMeta) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn calls(&self) -> Vec<ModelCallRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait::async_trait]
impl LanguageModel for MockLanguageModel {
    fn provider(&self) -> ProviderId {
        ProviderId::new("mock")
    }

    fn model_id(&self) -> String {
        self.model_id.clone()
    }

    async fn do_stream(&self, request: ModelCallRequest) -> Result<ModelStreamHandle, ModelError> {
        let step_number = request.step_number;
        let token = request.cancellation.clone();
        lock(&self.calls).push(request);
        let next = lock(&self.script).pop_front();
        let stream = match next {
            Some(MockStep::Events(events)) => stream::iter(events).boxed(),
            Some(MockStep::Pending(events)) => stream::iter(events.into_iter().map(Ok))
                .chain(stream::once(async move {
                    token.cancelled().await;
                    Err(ModelError::Cancelled)
                }))
                .boxed(),
            Some(MockStep::CallError(err)) => return Err(err),
            None => {
                return Err(ModelError::protocol(format!(
                    "no scripted response for step {step_number}"
                )));
            }
        };
        Ok(ModelStreamHandle {
            stream,
            metadata: self.metadata.clone(),
        })
    }
}

pub fn stream_start() -> RawEvent {
    RawEvent::StreamStart {
        warnings: Vec::new(),
    }
}

pub fn response_metadata(id: &str, model_id: &str) -> RawEvent {
    RawEvent::ResponseMetadata {
        id: Some(id.to_string()),
        timestamp: None,
        model_id: Some(model_id.to_string()),
    }
}

/// `text-start`, one delta per entry, `text-end`.
pub fn text_events(id: &str, deltas: &[&str]) -> Vec<RawEvent> {
    let mut events = vec![RawEvent::TextStart {
        id: id.to_string(),
        provider_metadata: None,
    }];
    events.extend(deltas.iter().map(|delta| RawEvent::TextDelta {
        id: id.to_string(),
        delta: (*delta).to_string(),
        provider_metadata: None,
    }));
    events.push(RawEvent::TextEnd {
        id: id.to_string(),
        provider_metadata: None,
    });
    events
}

pub fn tool_call(tool_call_id: &str, tool_name: &str, input: &str) -> RawEvent {
    RawEvent::ToolCall {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        input: input.to_string(),
        provider_executed: false,
        provider_metadata: None,
    }
}

pub fn finish(finish_reason: FinishReason, usage: Usage) -> RawEvent {
    RawEvent::Finish {
        finish_reason,
        usage,
        provider_metadata: None,
    }
}

pub fn raw_error(error: Value) -> RawEvent {
    RawEvent::Error { error }
}
