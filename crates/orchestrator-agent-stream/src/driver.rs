use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt as _;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::collect_tool_approvals;
use crate::broadcast::{Multiplexer, SharedRecorder, lock};
use crate::cancel::CancellationCoordinator;
use crate::errors::{ModelError, ResultError, RunFailure, StreamError};
use crate::id::IdGenerator;
use crate::message::ModelMessage;
use crate::model::{
    CallSettings, LanguageModel, ModelCallRequest, RawEvent, RawEventStream, ToolChoice,
};
use crate::registry::{ResultSlot, RunOutcome};
use crate::resolver::{RawToolCall, RepairToolCall, ToolCallResolver};
use crate::retry::{RetryPolicy, call_with_retry};
use crate::step::{StepRequest, StepResponse, StepResult};
use crate::stop::{StopCondition, is_stop_condition_met};
use crate::stream::StreamEvent;
use crate::tool::ToolSet;
use crate::transform::{Flow, TransformPipeline};
use crate::usage::{FinishReason, Usage};

/// What `prepare_step` sees before each model call.
pub struct PrepareStepContext<'a> {
    pub step_number: usize,
    pub steps: &'a [StepResult],
    pub messages: &'a [ModelMessage],
}

/// Per-step replacements for the run's defaults. Unset fields keep the default.
#[derive(Clone, Default)]
pub struct StepOverrides {
    pub model: Option<Arc<dyn LanguageModel>>,
    pub active_tools: Option<Vec<String>>,
    pub system: Option<String>,
    pub tool_choice: Option<ToolChoice>,
}

pub type PrepareStep =
    Arc<dyn Fn(&PrepareStepContext<'_>) -> Option<StepOverrides> + Send + Sync>;

pub type ChunkCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&StreamError) + Send + Sync>;
pub type StepFinishCallback = Arc<dyn Fn(&StepResult) + Send + Sync>;
pub type FinishCallback = Arc<dyn Fn(&RunOutcome) + Send + Sync>;
pub type AbortCallback = Arc<dyn Fn(&[StepResult]) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub on_chunk: Option<ChunkCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_step_finish: Option<StepFinishCallback>,
    pub on_finish: Option<FinishCallback>,
    pub on_abort: Option<AbortCallback>,
}

pub(crate) struct DriverConfig {
    pub run_id: Uuid,
    pub model: Arc<dyn LanguageModel>,
    pub system: Option<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Arc<ToolSet>,
    pub active_tools: Option<Vec<String>>,
    pub tool_choice: ToolChoice,
    pub settings: CallSettings,
    pub response_format: Option<Value>,
    pub stop_when: Vec<StopCondition>,
    pub prepare_step: Option<PrepareStep>,
    pub repair_tool_call: Option<RepairToolCall>,
    pub retry_policy: RetryPolicy,
    pub include_raw_chunks: bool,
    pub id_generator: IdGenerator,
    pub context: Value,
    pub callbacks: Callbacks,
}

/// Records, reports, and broadcasts post-transform events.
struct Publisher {
    recorder: SharedRecorder,
    mux: Multiplexer,
    callbacks: Callbacks,
}

impl Publisher {
    fn publish(&self, event: StreamEvent) {
        let observation = lock(&self.recorder).observe(&event);
        self.notify(&event);
        self.mux.publish(event);
        if let Some(error) = observation.error {
            self.notify(&error);
            self.mux.publish(error);
        }
        if let (Some(step), Some(on_step_finish)) =
            (observation.step, &self.callbacks.on_step_finish)
        {
            on_step_finish(&step);
        }
    }

    fn notify(&self, event: &StreamEvent) {
        if event.is_chunk()
            && let Some(on_chunk) = &self.callbacks.on_chunk
        {
            on_chunk(event);
        }
        if let StreamEvent::Error { error } = event
            && let Some(on_error) = &self.callbacks.on_error
        {
            on_error(error);
        }
    }
}

enum RunEnd {
    Finished,
    /// A transform asked to stop production.
    Stopped,
    Aborted,
    Failed(ModelError),
}

enum StepEnd {
    Completed,
    Stopped,
    Aborted,
    Failed(ModelError),
}

impl From<StepEnd> for RunEnd {
    fn from(end: StepEnd) -> Self {
        match end {
            StepEnd::Completed => RunEnd::Finished,
            StepEnd::Stopped => RunEnd::Stopped,
            StepEnd::Aborted => RunEnd::Aborted,
            StepEnd::Failed(err) => RunEnd::Failed(err),
        }
    }
}

/// Step bookkeeping that never reaches the recorder directly.
struct StepState {
    started: bool,
    request: StepRequest,
    warnings: Vec<String>,
    response: StepResponse,
    finish_reason: FinishReason,
    usage: Usage,
    provider_metadata: Option<Value>,
}

/// Runs the multi-step loop of one invocation.
///
/// The driver task is the only writer of the recorder; consumers and tool
/// executions only read or send values back.
pub(crate) struct StepDriver {
    config: DriverConfig,
    coordinator: CancellationCoordinator,
    pipeline: TransformPipeline,
    publisher: Publisher,
    outcome: ResultSlot<Arc<RunOutcome>>,
}

impl StepDriver {
    pub fn new(
        config: DriverConfig,
        coordinator: CancellationCoordinator,
        pipeline: TransformPipeline,
        recorder: SharedRecorder,
        mux: Multiplexer,
        outcome: ResultSlot<Arc<RunOutcome>>,
    ) -> Self {
        let callbacks = config.callbacks.clone();
        Self {
            config,
            coordinator,
            pipeline,
            publisher: Publisher {
                recorder,
                mux,
                callbacks,
            },
            outcome,
        }
    }

    pub async fn run(mut self) {
        let token = self.coordinator.token().clone();
        let run_id = self.config.run_id;
        info!(
            run_id = %run_id,
            provider = %self.config.model.provider(),
            model_id = %self.config.model.model_id(),
            "stream run started"
        );

        let mut resolver = ToolCallResolver::new(
            self.config.tools.clone(),
            token.clone(),
            self.config.context.clone(),
            self.config.id_generator.clone(),
        )
        .with_repair(self.config.repair_tool_call.clone());
        let end = self.drive(&mut resolver, &token).await;
        match end {
            RunEnd::Finished => self.finish().await,
            RunEnd::Stopped => self.stop().await,
            RunEnd::Aborted => self.abort(),
            RunEnd::Failed(err) => self.fail(err),
        }
        self.publisher.mux.close();
        info!(run_id = %run_id, "stream run ended");
    }

    /// Sends one event through the transforms. `Some` ends production.
    async fn emit(&mut self, event: StreamEvent) -> Option<StepEnd> {
        let publisher = &self.publisher;
        match self
            .pipeline
            .process(event, &mut |event| publisher.publish(event))
            .await
        {
            Flow::Continue => None,
            Flow::Stopped => Some(StepEnd::Stopped),
            Flow::Aborted => Some(StepEnd::Aborted),
        }
    }

    async fn drive(&mut self, resolver: &mut ToolCallResolver, token: &CancellationToken) -> RunEnd {
        if let Some(end) = self.emit(StreamEvent::Start).await {
            return end.into();
        }
        if token.is_cancelled() {
            return RunEnd::Aborted;
        }
        if let Some(end) = self.ingest_approvals(resolver, token).await {
            return end;
        }

        let mut step_number = 0;
        loop {
            if token.is_cancelled() {
                return RunEnd::Aborted;
            }
            let recorded_before = lock(&self.publisher.recorder).steps().len();
            match self.run_step(step_number, resolver, token).await {
                StepEnd::Completed => {}
                other => return other.into(),
            }
            if !self.should_continue(recorded_before) {
                return RunEnd::Finished;
            }
            step_number += 1;
        }
    }

    /// Resolves approvals answered in the incoming history before the first step.
    async fn ingest_approvals(
        &mut self,
        resolver: &mut ToolCallResolver,
        token: &CancellationToken,
    ) -> Option<RunEnd> {
        let approvals = collect_tool_approvals(&self.config.messages, &self.config.tools);
        if approvals.is_empty() {
            return None;
        }
        debug!(
            run_id = %self.config.run_id,
            approved = approvals.approved.len(),
            denied = approvals.denied.len(),
            "resolving tool approvals"
        );

        for approved in &approvals.approved {
            resolver.execute_approved(&approved.tool_call, &self.config.messages);
        }
        for denied in approvals.denied {
            resolver.record_denied(&denied.tool_call);
            let end = self
                .emit(StreamEvent::ToolOutputDenied {
                    tool_call_id: denied.tool_call.tool_call_id,
                    tool_name: denied.tool_call.tool_name,
                    reason: denied.reason,
                })
                .await;
            if let Some(end) = end {
                return Some(end.into());
            }
        }
        while resolver.has_outstanding() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Some(RunEnd::Aborted),
                settlement = resolver.next_settlement() => {
                    let Some(event) = settlement else { break };
                    if let Some(end) = self.emit(event).await {
                        return Some(end.into());
                    }
                }
            }
        }
        None
    }

    async fn run_step(
        &mut self,
        step_number: usize,
        resolver: &mut ToolCallResolver,
        token: &CancellationToken,
    ) -> StepEnd {
        let (steps, history) = {
            let mut recorder = lock(&self.publisher.recorder);
            recorder.flush_pending_tool_parts();
            (
                recorder.steps().to_vec(),
                recorder.response_messages().to_vec(),
            )
        };
        let mut messages = self.config.messages.clone();
        messages.extend(history);

        let overrides = self
            .config
            .prepare_step
            .as_ref()
            .and_then(|prepare| {
                prepare(&PrepareStepContext {
                    step_number,
                    steps: &steps,
                    messages: &messages,
                })
            })
            .unwrap_or_default();
        let model = overrides
            .model
            .unwrap_or_else(|| self.config.model.clone());
        let active_tools = overrides
            .active_tools
            .or_else(|| self.config.active_tools.clone());
        let request = ModelCallRequest {
            run_id: self.config.run_id,
            step_number,
            system: overrides.system.or_else(|| self.config.system.clone()),
            messages: messages.clone(),
            tools: self.config.tools.definitions(active_tools.as_deref()),
            tool_choice: overrides
                .tool_choice
                .unwrap_or_else(|| self.config.tool_choice.clone()),
            settings: self.config.settings.clone(),
            response_format: self.config.response_format.clone(),
            include_raw_chunks: self.config.include_raw_chunks,
            cancellation: token.clone(),
        };
        debug!(
            run_id = %self.config.run_id,
            step = step_number,
            provider = %model.provider(),
            model_id = %model.model_id(),
            tools = request.tools.len(),
            "model call started"
        );

        let established = tokio::select! {
            biased;
            _ = token.cancelled() => return StepEnd::Aborted,
            result = call_with_retry(&self.config.retry_policy, token, || model.do_stream(request.clone())) => result,
        };
        let handle = match established {
            Ok(handle) => handle,
            Err(err) => return model_failure(err, token),
        };

        let mut state = StepState {
            started: false,
            request: StepRequest {
                body: handle.metadata.request_body,
            },
            warnings: Vec::new(),
            response: StepResponse {
                id: (self.config.id_generator)(),
                timestamp: Utc::now(),
                model_id: model.model_id(),
                headers: handle.metadata.headers,
            },
            finish_reason: FinishReason::Unknown,
            usage: Usage::default(),
            provider_metadata: None,
        };
        let mut stream: RawEventStream = handle.stream;
        let mut raw_done = false;

        while !raw_done || resolver.has_outstanding() {
            let events = tokio::select! {
                biased;
                _ = token.cancelled() => return StepEnd::Aborted,
                settlement = resolver.next_settlement(), if resolver.has_outstanding() => {
                    settlement.into_iter().collect()
                }
                item = stream.next(), if !raw_done => match item {
                    None => {
                        raw_done = true;
                        Vec::new()
                    }
                    Some(Err(err)) => return model_failure(err, token),
                    Some(Ok(raw)) => self.translate(raw, &mut state, resolver, &messages),
                },
            };
            for event in events {
                if let Some(end) = self.emit(event).await {
                    return end;
                }
            }
        }

        if !state.started {
            let start = start_step_event(&mut state);
            if let Some(end) = self.emit(start).await {
                return end;
            }
        }
        debug!(
            run_id = %self.config.run_id,
            step = step_number,
            finish_reason = %state.finish_reason,
            "step finished"
        );
        resolver.finish_step();
        let finish = StreamEvent::FinishStep {
            response: state.response,
            usage: state.usage,
            finish_reason: state.finish_reason,
            provider_metadata: state.provider_metadata,
        };
        if let Some(end) = self.emit(finish).await {
            return end;
        }
        StepEnd::Completed
    }

    /// Maps one raw event to canonical events, updating step state.
    fn translate(
        &self,
        raw: RawEvent,
        state: &mut StepState,
        resolver: &mut ToolCallResolver,
        messages: &[ModelMessage],
    ) -> Vec<StreamEvent> {
        if let RawEvent::StreamStart { warnings } = raw {
            state.warnings = warnings;
            return Vec::new();
        }
        let mut events = Vec::new();
        if !state.started {
            events.push(start_step_event(state));
        }
        match raw {
            RawEvent::StreamStart { .. } => {}
            RawEvent::ResponseMetadata {
                id,
                timestamp,
                model_id,
            } => {
                if let Some(id) = id {
                    state.response.id = id;
                }
                if let Some(timestamp) = timestamp {
                    state.response.timestamp = timestamp;
                }
                if let Some(model_id) = model_id {
                    state.response.model_id = model_id;
                }
            }
            RawEvent::TextStart {
                id,
                provider_metadata,
            } => events.push(StreamEvent::TextStart {
                id,
                provider_metadata,
            }),
            RawEvent::TextDelta {
                id,
                delta,
                provider_metadata,
            } => {
                if !delta.is_empty() {
                    events.push(StreamEvent::TextDelta {
                        id,
                        text: delta,
                        provider_metadata,
                    });
                }
            }
            RawEvent::TextEnd {
                id,
                provider_metadata,
            } => events.push(StreamEvent::TextEnd {
                id,
                provider_metadata,
            }),
            RawEvent::ReasoningStart {
                id,
                provider_metadata,
            } => events.push(StreamEvent::ReasoningStart {
                id,
                provider_metadata,
            }),
            RawEvent::ReasoningDelta {
                id,
                delta,
                provider_metadata,
            } => {
                if !delta.is_empty() {
                    events.push(StreamEvent::ReasoningDelta {
                        id,
                        text: delta,
                        provider_metadata,
                    });
                }
            }
            RawEvent::ReasoningEnd {
                id,
                provider_metadata,
            } => events.push(StreamEvent::ReasoningEnd {
                id,
                provider_metadata,
            }),
            RawEvent::ToolInputStart {
                id,
                tool_name,
                provider_executed,
            } => events.push(resolver.on_input_start(id, tool_name, provider_executed, messages)),
            RawEvent::ToolInputDelta { id, delta } => {
                events.push(resolver.on_input_delta(id, delta, messages));
            }
            RawEvent::ToolInputEnd { id } => events.push(resolver.on_input_end(id)),
            RawEvent::ToolCall {
                tool_call_id,
                tool_name,
                input,
                provider_executed,
                provider_metadata,
            } => {
                debug!(
                    run_id = %self.config.run_id,
                    tool_call_id = %tool_call_id,
                    tool_name = %tool_name,
                    provider_executed,
                    "tool call received"
                );
                events.extend(resolver.on_tool_call(
                    RawToolCall {
                        tool_call_id,
                        tool_name,
                        input,
                        provider_executed,
                        provider_metadata,
                    },
                    messages,
                ));
            }
            RawEvent::ToolResult {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => events.push(resolver.on_provider_result(
                tool_call_id,
                tool_name,
                result,
                is_error,
            )),
            RawEvent::Source(source) => events.push(StreamEvent::Source(source)),
            RawEvent::File(file) => events.push(StreamEvent::File(file)),
            RawEvent::Finish {
                finish_reason,
                usage,
                provider_metadata,
            } => {
                state.finish_reason = finish_reason;
                state.usage = usage;
                state.provider_metadata = provider_metadata;
            }
            RawEvent::Error { error } => {
                warn!(run_id = %self.config.run_id, error = %error, "provider reported a stream error");
                state.finish_reason = FinishReason::Error;
                events.push(StreamEvent::Error {
                    error: StreamError::Provider(error),
                });
            }
            RawEvent::Raw { value } => {
                if self.config.include_raw_chunks {
                    events.push(StreamEvent::Raw { value });
                }
            }
        }
        events
    }

    /// Continue only when every client-side call of the step that was just
    /// recorded has an output and no stop condition holds.
    fn should_continue(&self, recorded_before: usize) -> bool {
        let recorder = lock(&self.publisher.recorder);
        let steps = recorder.steps();
        if steps.len() == recorded_before {
            return false;
        }
        let Some(step) = steps.last() else {
            return false;
        };
        let client_calls = step
            .tool_calls()
            .iter()
            .filter(|call| !call.provider_executed)
            .count();
        let client_outputs = step
            .tool_results()
            .iter()
            .filter(|result| !result.provider_executed)
            .count()
            + step
                .tool_errors()
                .iter()
                .filter(|failure| !failure.provider_executed)
                .count();
        client_calls > 0
            && client_outputs == client_calls
            && !is_stop_condition_met(&self.config.stop_when, steps)
    }

    fn settle_outcome(&self) -> Result<Arc<RunOutcome>, ResultError> {
        let recorder = lock(&self.publisher.recorder);
        RunOutcome::from_steps(
            recorder.steps().to_vec(),
            recorder.response_messages().to_vec(),
        )
        .map(Arc::new)
        .ok_or(ResultError::NoOutput)
    }

    fn resolve(&self) {
        let outcome = self.settle_outcome();
        if let (Ok(outcome), Some(on_finish)) = (&outcome, &self.config.callbacks.on_finish) {
            on_finish(outcome);
        }
        self.outcome.fulfill(outcome);
    }

    async fn finish(&mut self) {
        let (finish_reason, total_usage) = {
            let recorder = lock(&self.publisher.recorder);
            (
                recorder
                    .last_step()
                    .map_or(FinishReason::Unknown, |step| step.finish_reason),
                recorder.total_usage(),
            )
        };
        info!(
            run_id = %self.config.run_id,
            finish_reason = %finish_reason,
            "stream run finished"
        );
        let end = self
            .emit(StreamEvent::Finish {
                finish_reason,
                total_usage,
            })
            .await;
        if matches!(end, Some(StepEnd::Aborted)) {
            self.abort();
            return;
        }
        self.flush().await;
        self.resolve();
    }

    async fn stop(&mut self) {
        debug!(run_id = %self.config.run_id, "transform stopped production");
        self.flush().await;
        self.resolve();
    }

    async fn flush(&mut self) {
        let publisher = &self.publisher;
        self.pipeline
            .flush(&mut |event| publisher.publish(event))
            .await;
    }

    fn abort(&mut self) {
        info!(run_id = %self.config.run_id, "stream run aborted");
        let steps = lock(&self.publisher.recorder).steps().to_vec();
        if let Some(on_abort) = &self.config.callbacks.on_abort {
            on_abort(&steps);
        }
        self.publisher.publish(StreamEvent::Abort);
        let outcome = if steps.is_empty() {
            Err(ResultError::Failed(RunFailure::Cancelled))
        } else {
            self.settle_outcome()
        };
        self.outcome.fulfill(outcome);
    }

    fn fail(&mut self, err: ModelError) {
        warn!(run_id = %self.config.run_id, error = %err, "stream run failed");
        let failure = RunFailure::from(&err);
        self.publisher.publish(StreamEvent::Error {
            error: StreamError::Model(err),
        });
        self.outcome.fulfill(Err(ResultError::Failed(failure)));
    }
}

fn start_step_event(state: &mut StepState) -> StreamEvent {
    state.started = true;
    StreamEvent::StartStep {
        request: state.request.clone(),
        warnings: state.warnings.clone(),
    }
}

/// Errors caused by the cancellation token end the run as an abort.
fn model_failure(err: ModelError, token: &CancellationToken) -> StepEnd {
    if token.is_cancelled() || matches!(err, ModelError::Cancelled) {
        StepEnd::Aborted
    } else {
        StepEnd::Failed(err)
    }
}
