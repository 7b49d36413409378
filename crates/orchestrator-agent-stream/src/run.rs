use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt as _;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{
    FullStream, Multiplexer, SharedRecorder, SseBody, TextBody, TextStream, WireStream, lock,
};
use crate::cancel::{AbortHandle, CancellationCoordinator};
use crate::content::{ContentPart, GeneratedFile, Source, ToolCall, ToolResult};
use crate::driver::{Callbacks, DriverConfig, PrepareStep, PrepareStepContext, StepDriver, StepOverrides};
use crate::errors::{AgentError, StreamError};
use crate::id::{IdGenerator, uuid_generator};
use crate::message::ModelMessage;
use crate::model::{CallSettings, LanguageModel, ToolChoice};
use crate::output::{Output, PartialOutputStream};
use crate::recorder::{StepRecorder, TranscriptSnapshot};
use crate::registry::{ResponseTranscript, ResultHandle, ResultSlot, RunOutcome};
use crate::resolver::{RawToolCall, RepairToolCall, ToolCallRepair};
use crate::response::{ResponseInit, StreamResponse, sse_response, text_response};
use crate::retry::RetryPolicy;
use crate::step::StepResult;
use crate::stop::{StopCondition, step_count_is};
use crate::stream::StreamEvent;
use crate::tool::ToolSet;
use crate::transform::{StreamTransform, TransformPipeline};
use crate::usage::{FinishReason, Usage};
use crate::wire::WireStreamOptions;

/// Entry point for streaming text generation with tools.
pub struct StreamText;

impl StreamText {
    pub fn builder(model: Arc<dyn LanguageModel>) -> StreamTextBuilder {
        StreamTextBuilder::new(model)
    }
}

/// Builder for configuring and starting a single streamed run.
///
/// Provide a prompt or a message history, optionally tools and callbacks,
/// then call [`StreamTextBuilder::start`].
pub struct StreamTextBuilder {
    model: Arc<dyn LanguageModel>,
    system: Option<String>,
    prompt: Option<String>,
    messages: Option<Vec<ModelMessage>>,
    tools: ToolSet,
    active_tools: Option<Vec<String>>,
    tool_choice: ToolChoice,
    settings: CallSettings,
    output: Option<Output>,
    stop_when: Vec<StopCondition>,
    prepare_step: Option<PrepareStep>,
    repair_tool_call: Option<RepairToolCall>,
    transforms: Vec<Box<dyn StreamTransform>>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
    include_raw_chunks: bool,
    abort_signal: Option<CancellationToken>,
    id_generator: IdGenerator,
    context: Value,
    callbacks: Callbacks,
}

impl StreamTextBuilder {
    fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            system: None,
            prompt: None,
            messages: None,
            tools: ToolSet::new(),
            active_tools: None,
            tool_choice: ToolChoice::Auto,
            settings: CallSettings::default(),
            output: None,
            stop_when: Vec::new(),
            prepare_step: None,
            repair_tool_call: None,
            transforms: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout: None,
            include_raw_chunks: false,
            abort_signal: None,
            id_generator: uuid_generator(),
            context: Value::Null,
            callbacks: Callbacks::default(),
        }
    }

    /// Sets the system instructions.
    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.system = Some(text.into());
        self
    }

    /// Single user message. Mutually exclusive with `messages`.
    pub fn prompt(mut self, text: impl Into<String>) -> Self {
        self.prompt = Some(text.into());
        self
    }

    /// Full conversation history. A trailing tool message with approval
    /// responses resolves those approvals before the first step.
    pub fn messages(mut self, messages: Vec<ModelMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Tools the model may call.
    pub fn tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    /// Limits the tool definitions sent to the model.
    pub fn active_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Defaults to `Auto`.
    pub fn tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    /// Generation settings forwarded to every model call.
    pub fn settings(mut self, settings: CallSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Parses the final text into `output` and enables partial output streaming.
    pub fn output(mut self, output: Output) -> Self {
        self.output = Some(output);
        self
    }

    /// Adds a stop condition. Without any, the run stops after one step.
    pub fn stop_when(mut self, condition: StopCondition) -> Self {
        self.stop_when.push(condition);
        self
    }

    /// Computes per-step overrides before each model call.
    pub fn prepare_step(
        mut self,
        f: impl Fn(&PrepareStepContext<'_>) -> Option<StepOverrides> + Send + Sync + 'static,
    ) -> Self {
        self.prepare_step = Some(Arc::new(f));
        self
    }

    /// Appends a transform stage. Stages run in the order they were added.
    pub fn transform(mut self, stage: impl StreamTransform + 'static) -> Self {
        self.transforms.push(Box::new(stage));
        self
    }

    /// Offers invalid tool calls to `f` before they are reported as errors.
    /// A returned call is parsed and validated again.
    pub fn repair_tool_call(
        mut self,
        f: impl Fn(&ToolCallRepair<'_>) -> Option<RawToolCall> + Send + Sync + 'static,
    ) -> Self {
        self.repair_tool_call = Some(Arc::new(f));
        self
    }

    /// Retry policy for establishing each model call.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Aborts the run once `timeout` has elapsed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Forwards unparsed provider chunks as `raw` events.
    pub fn include_raw_chunks(mut self, include: bool) -> Self {
        self.include_raw_chunks = include;
        self
    }

    /// External cancellation signal. Cancelling it aborts the run.
    pub fn abort_signal(mut self, token: CancellationToken) -> Self {
        self.abort_signal = Some(token);
        self
    }

    /// Id source for approval requests and step response ids.
    pub fn id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    /// Opaque value handed to every tool execution and approval predicate.
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Called for every content chunk after transforms.
    pub fn on_chunk(mut self, f: impl Fn(&StreamEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.on_chunk = Some(Arc::new(f));
        self
    }

    /// Called for model failures and in-stream errors. Never for cancellation.
    pub fn on_error(mut self, f: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Called with each step as soon as it is recorded.
    pub fn on_step_finish(mut self, f: impl Fn(&StepResult) + Send + Sync + 'static) -> Self {
        self.callbacks.on_step_finish = Some(Arc::new(f));
        self
    }

    /// Called once when the run completes with at least one step.
    pub fn on_finish(mut self, f: impl Fn(&RunOutcome) + Send + Sync + 'static) -> Self {
        self.callbacks.on_finish = Some(Arc::new(f));
        self
    }

    /// Called with the completed steps when the run is aborted.
    pub fn on_abort(mut self, f: impl Fn(&[StepResult]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_abort = Some(Arc::new(f));
        self
    }

    /// Validates the builder state and spawns the run on the current tokio runtime.
    ///
    /// Events start flowing immediately; consumers attached later still see
    /// the whole stream.
    pub fn start(self) -> Result<StreamTextResult, AgentError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AgentError::Config("start() must be called within a tokio runtime".into())
        })?;
        let messages = self.validate()?;

        let run_id = Uuid::new_v4();
        let coordinator = CancellationCoordinator::new(self.abort_signal.as_ref(), self.timeout);
        let abort = AbortHandle::from_token(coordinator.token().clone());
        let recorder: SharedRecorder = Arc::new(Mutex::new(StepRecorder::new()));
        let mux = Multiplexer::new();
        let (slot, outcome) = ResultSlot::new();
        let tools = Arc::new(self.tools);
        let stop_when = if self.stop_when.is_empty() {
            vec![step_count_is(1)]
        } else {
            self.stop_when
        };

        let config = DriverConfig {
            run_id,
            model: self.model,
            system: self.system.filter(|s| !s.trim().is_empty()),
            messages,
            tools: tools.clone(),
            active_tools: self.active_tools,
            tool_choice: self.tool_choice,
            settings: self.settings,
            response_format: self.output.as_ref().and_then(Output::response_format),
            stop_when,
            prepare_step: self.prepare_step,
            repair_tool_call: self.repair_tool_call,
            retry_policy: self.retry_policy,
            include_raw_chunks: self.include_raw_chunks,
            id_generator: self.id_generator,
            context: self.context,
            callbacks: self.callbacks,
        };
        let pipeline = TransformPipeline::new(self.transforms, tools)
            .with_cancellation(coordinator.token().clone());
        let driver = StepDriver::new(
            config,
            coordinator,
            pipeline,
            recorder.clone(),
            mux.clone(),
            slot,
        );
        runtime.spawn(driver.run());

        Ok(StreamTextResult {
            run_id,
            abort,
            mux,
            recorder,
            outcome,
            output: self.output,
        })
    }

    fn validate(&self) -> Result<Vec<ModelMessage>, AgentError> {
        let messages = match (&self.prompt, &self.messages) {
            (Some(_), Some(_)) => {
                return Err(AgentError::Validation(
                    "prompt and messages cannot both be set".into(),
                ));
            }
            (Some(prompt), None) => {
                if prompt.trim().is_empty() {
                    return Err(AgentError::Validation("prompt must not be empty".into()));
                }
                vec![ModelMessage::user(prompt.clone())]
            }
            (None, Some(messages)) if !messages.is_empty() => messages.clone(),
            _ => {
                return Err(AgentError::Validation(
                    "a prompt or at least one message is required".into(),
                ));
            }
        };
        if let Some(active) = &self.active_tools
            && let Some(unknown) = active.iter().find(|name| self.tools.get(name).is_none())
        {
            return Err(AgentError::Validation(format!(
                "active tool `{unknown}` is not in the tool set"
            )));
        }
        if let ToolChoice::Tool { tool_name } = &self.tool_choice
            && self.tools.get(tool_name).is_none()
        {
            return Err(AgentError::Validation(format!(
                "tool choice `{tool_name}` is not in the tool set"
            )));
        }
        Ok(messages)
    }
}

/// Handle to a running stream.
///
/// Any number of consumers may be attached; each sees every event in the
/// same order. The async accessors wait for the run to end.
pub struct StreamTextResult {
    run_id: Uuid,
    abort: AbortHandle,
    mux: Multiplexer,
    recorder: SharedRecorder,
    outcome: ResultHandle<Arc<RunOutcome>>,
    output: Option<Output>,
}

impl StreamTextResult {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns a handle that can cancel the run.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Text deltas only.
    pub fn text_stream(&self) -> TextStream {
        TextStream::new(&self.mux, self.recorder.clone())
    }

    /// Every canonical event, errors unmasked.
    pub fn full_stream(&self) -> FullStream {
        FullStream::new(&self.mux, self.recorder.clone())
    }

    /// UI message stream chunks.
    pub fn wire_stream(&self, options: WireStreamOptions) -> WireStream {
        WireStream::new(&self.mux, self.recorder.clone(), options)
    }

    /// Partial values of the configured output as the text grows.
    pub fn partial_output_stream(&self) -> Result<PartialOutputStream, AgentError> {
        let output = self.output.clone().ok_or_else(no_output_specified)?;
        Ok(PartialOutputStream::new(self.full_stream(), output))
    }

    /// Final step's text parsed with the configured output.
    pub async fn output(&self) -> Result<Value, AgentError> {
        let output = self.output.as_ref().ok_or_else(no_output_specified)?;
        let text = self.resolved().await?.text();
        output.parse_complete(&text)
    }

    /// Steps and partial content recorded so far.
    pub fn transcript(&self) -> TranscriptSnapshot {
        lock(&self.recorder).snapshot()
    }

    pub fn outcome(&self) -> ResultHandle<Arc<RunOutcome>> {
        self.outcome.clone()
    }

    async fn resolved(&self) -> Result<Arc<RunOutcome>, AgentError> {
        Ok(self.outcome.get().await?)
    }

    /// Text of the final step.
    pub async fn text(&self) -> Result<String, AgentError> {
        Ok(self.resolved().await?.text())
    }

    pub async fn reasoning(&self) -> Result<Vec<ContentPart>, AgentError> {
        Ok(self.resolved().await?.reasoning())
    }

    pub async fn reasoning_text(&self) -> Result<Option<String>, AgentError> {
        Ok(self.resolved().await?.reasoning_text())
    }

    pub async fn sources(&self) -> Result<Vec<Source>, AgentError> {
        Ok(self.resolved().await?.sources())
    }

    pub async fn files(&self) -> Result<Vec<GeneratedFile>, AgentError> {
        Ok(self.resolved().await?.files())
    }

    pub async fn tool_calls(&self) -> Result<Vec<ToolCall>, AgentError> {
        Ok(self.resolved().await?.tool_calls())
    }

    pub async fn tool_results(&self) -> Result<Vec<ToolResult>, AgentError> {
        Ok(self.resolved().await?.tool_results())
    }

    pub async fn content(&self) -> Result<Vec<ContentPart>, AgentError> {
        Ok(self.resolved().await?.content().to_vec())
    }

    pub async fn steps(&self) -> Result<Vec<StepResult>, AgentError> {
        Ok(self.resolved().await?.steps().to_vec())
    }

    /// Usage of the final step.
    pub async fn usage(&self) -> Result<Usage, AgentError> {
        Ok(self.resolved().await?.usage())
    }

    pub async fn total_usage(&self) -> Result<Usage, AgentError> {
        Ok(self.resolved().await?.total_usage())
    }

    pub async fn finish_reason(&self) -> Result<FinishReason, AgentError> {
        Ok(self.resolved().await?.finish_reason())
    }

    pub async fn provider_metadata(&self) -> Result<Option<Value>, AgentError> {
        Ok(self.resolved().await?.provider_metadata().cloned())
    }

    pub async fn warnings(&self) -> Result<Vec<String>, AgentError> {
        Ok(self.resolved().await?.warnings().to_vec())
    }

    pub async fn response(&self) -> Result<ResponseTranscript, AgentError> {
        Ok(self.resolved().await?.response().clone())
    }

    /// Drains the stream without looking at it so the run completes.
    pub async fn consume(&self) {
        let mut events = self.full_stream();
        while events.next().await.is_some() {}
    }

    /// SSE response carrying the wire stream.
    pub fn to_wire_response(
        &self,
        init: ResponseInit,
        options: WireStreamOptions,
    ) -> StreamResponse<SseBody> {
        sse_response(init, self.wire_stream(options).into_sse())
    }

    /// Plain UTF-8 response carrying the text deltas.
    pub fn to_text_response(&self, init: ResponseInit) -> StreamResponse<TextBody> {
        text_response(init, TextBody::new(self.text_stream()))
    }
}

fn no_output_specified() -> AgentError {
    AgentError::Validation("no output specified; set one with `output`".into())
}

/// Consumers already attached keep reading; the replay history is freed
/// because nothing can attach anymore.
impl Drop for StreamTextResult {
    fn drop(&mut self) {
        self.mux.release_history();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures::StreamExt as _;
    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::errors::{ModelError, ResultError, RunFailure, ToolError};
    use crate::id::counter_generator;
    use crate::message::{AssistantPart, ToolMessagePart, ToolResultOutput};
    use crate::smooth::SmoothStream;
    use crate::stop::has_tool_call;
    use crate::testing::{
        MockLanguageModel, MockStep, finish, raw_error, response_metadata, stream_start,
        text_events, tool_call,
    };
    use crate::tool::{NeedsApproval, ObjectSchema, Tool, ToolExecution, ToolUpdate};
    use crate::wire::{SSE_DONE, SseDecoder, WireChunk};

    fn model(steps: Vec<MockStep>) -> Arc<MockLanguageModel> {
        Arc::new(MockLanguageModel::new(steps))
    }

    fn hello_world() -> MockStep {
        let mut events = vec![stream_start(), response_metadata("resp-0", "mock-model-id")];
        events.extend(text_events("1", &["Hello", ", ", "world!"]));
        events.push(finish(FinishReason::Stop, Usage::new(3, 10)));
        MockStep::events(events)
    }

    fn tool1(executions: Arc<AtomicUsize>) -> Tool {
        Tool::new("tool1")
            .input_schema(ObjectSchema::new(json!({
                "type": "object",
                "properties": { "value": { "type": "string" } },
                "required": ["value"]
            })))
            .execute_sync(move |input, _options| {
                executions.fetch_add(1, Ordering::SeqCst);
                assert_eq!(input, json!({ "value": "value" }));
                Ok(json!("value-result"))
            })
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::kind).collect()
    }

    #[tokio::test]
    async fn text_stream_yields_deltas_and_final_text() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");

        let deltas: Vec<String> = result.text_stream().collect().await;
        assert_eq!(deltas, vec!["Hello", ", ", "world!"]);
        assert_eq!(result.text().await.expect("text"), "Hello, world!");
        assert_eq!(result.finish_reason().await.expect("reason"), FinishReason::Stop);
        assert_eq!(result.usage().await.expect("usage"), Usage::new(3, 10));
        let response = result.response().await.expect("response");
        assert_eq!(response.id, "resp-0");
        assert_eq!(response.model_id, "mock-model-id");
    }

    #[tokio::test]
    async fn full_stream_has_step_framing() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(
            kinds(&events),
            vec![
                "start",
                "start-step",
                "text-start",
                "text-delta",
                "text-delta",
                "text-delta",
                "text-end",
                "finish-step",
                "finish"
            ]
        );
    }

    #[tokio::test]
    async fn empty_deltas_are_suppressed() {
        let mut events = text_events("1", &["", "a", "", "b"]);
        events.push(finish(FinishReason::Stop, Usage::default()));
        let result = StreamText::builder(model(vec![MockStep::events(events)]))
            .prompt("hi")
            .start()
            .expect("start");
        let deltas: Vec<String> = result.text_stream().collect().await;
        assert_eq!(deltas, vec!["a", "b"]);
        assert_eq!(result.text().await.expect("text"), "ab");
    }

    #[tokio::test]
    async fn interleaved_parts_keep_their_own_order() {
        let delta = |id: &str, text: &str| crate::model::RawEvent::TextDelta {
            id: id.into(),
            delta: text.into(),
            provider_metadata: None,
        };
        let reasoning = |text: &str| crate::model::RawEvent::ReasoningDelta {
            id: "r".into(),
            delta: text.into(),
            provider_metadata: None,
        };
        let events = vec![
            crate::model::RawEvent::ReasoningStart {
                id: "r".into(),
                provider_metadata: None,
            },
            crate::model::RawEvent::TextStart {
                id: "t".into(),
                provider_metadata: None,
            },
            reasoning("think "),
            delta("t", "an"),
            reasoning("hard"),
            delta("t", "swer"),
            crate::model::RawEvent::ReasoningEnd {
                id: "r".into(),
                provider_metadata: None,
            },
            crate::model::RawEvent::TextEnd {
                id: "t".into(),
                provider_metadata: None,
            },
            finish(FinishReason::Stop, Usage::default()),
        ];
        let result = StreamText::builder(model(vec![MockStep::events(events)]))
            .prompt("hi")
            .start()
            .expect("start");
        assert_eq!(result.text().await.expect("text"), "answer");
        assert_eq!(
            result.reasoning_text().await.expect("reasoning"),
            Some("think hard".to_string())
        );
    }

    #[tokio::test]
    async fn tool_result_is_streamed_and_recorded() {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut events = text_events("1", &["Calling."]);
        events.push(tool_call("call-1", "tool1", r#"{"value":"value"}"#));
        events.push(finish(FinishReason::ToolCalls, Usage::new(5, 5)));
        let result = StreamText::builder(model(vec![MockStep::events(events)]))
            .prompt("hi")
            .tools(ToolSet::new().with(tool1(executions.clone())))
            .start()
            .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let call_at = events
            .iter()
            .position(|event| matches!(event, StreamEvent::ToolCall(_)))
            .expect("tool call");
        let result_at = events
            .iter()
            .position(|event| matches!(event, StreamEvent::ToolResult(_)))
            .expect("tool result");
        assert!(call_at < result_at);
        let StreamEvent::ToolResult(tool_result) = &events[result_at] else {
            panic!("expected tool result");
        };
        assert_eq!(tool_result.output, json!("value-result"));
        assert!(!tool_result.preliminary);
        let finish_step_at = events
            .iter()
            .position(|event| matches!(event, StreamEvent::FinishStep { .. }))
            .expect("finish step");
        assert!(result_at < finish_step_at);

        let messages = result.response().await.expect("response").messages;
        assert_eq!(messages.len(), 2);
        let ModelMessage::Assistant { content } = &messages[0] else {
            panic!("expected assistant message");
        };
        assert!(matches!(&content[0], AssistantPart::Text { text, .. } if text == "Calling."));
        assert!(matches!(&content[1], AssistantPart::ToolCall { tool_name, .. } if tool_name == "tool1"));
        let ModelMessage::Tool { content } = &messages[1] else {
            panic!("expected tool message");
        };
        assert_eq!(
            content,
            &vec![ToolMessagePart::ToolResult {
                tool_call_id: "call-1".into(),
                tool_name: "tool1".into(),
                output: ToolResultOutput::Text("value-result".into()),
            }]
        );
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_yields_abort_without_error_callback() {
        let aborted_steps = Arc::new(Mutex::new(None));
        let errors = Arc::new(AtomicUsize::new(0));
        let seen_steps = aborted_steps.clone();
        let error_count = errors.clone();
        let result = StreamText::builder(model(vec![MockStep::Pending(vec![
            stream_start(),
            response_metadata("resp-0", "mock-model-id"),
        ])]))
        .prompt("hi")
        .on_abort(move |steps| {
            *seen_steps.lock().expect("lock") = Some(steps.len());
        })
        .on_error(move |_| {
            error_count.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .expect("start");

        let mut stream = result.full_stream();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            let is_start_step = matches!(event, StreamEvent::StartStep { .. });
            events.push(event);
            if is_start_step {
                result.abort();
            }
        }
        assert_eq!(kinds(&events), vec!["start", "start-step", "abort"]);
        assert_eq!(*aborted_steps.lock().expect("lock"), Some(0));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(matches!(
            result.text().await,
            Err(AgentError::Result(ResultError::Failed(RunFailure::Cancelled)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_run() {
        let result = StreamText::builder(model(vec![MockStep::Pending(vec![stream_start()])]))
            .prompt("hi")
            .timeout(Duration::from_millis(100))
            .start()
            .expect("start");
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(events.last(), Some(&StreamEvent::Abort));
    }

    #[tokio::test]
    async fn external_abort_signal_cancels_run() {
        let signal = CancellationToken::new();
        let result = StreamText::builder(model(vec![MockStep::Pending(Vec::new())]))
            .prompt("hi")
            .abort_signal(signal.clone())
            .start()
            .expect("start");
        signal.cancel();
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(events.last(), Some(&StreamEvent::Abort));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_interrupts_paced_smoothing() {
        let text: String = (0..20).map(|i| format!("w{i} ")).collect();
        let mut events = text_events("1", &[text.as_str()]);
        events.push(finish(FinishReason::Stop, Usage::default()));
        let result = StreamText::builder(model(vec![MockStep::events(events)]))
            .prompt("hi")
            .transform(SmoothStream::new().delay(Some(Duration::from_secs(1))))
            .start()
            .expect("start");
        let abort = result.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            abort.abort();
        });

        let started = tokio::time::Instant::now();
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        let deltas = events
            .iter()
            .filter(|event| matches!(event, StreamEvent::TextDelta { .. }))
            .count();
        assert_eq!(deltas, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Abort));
        assert!(matches!(
            result.text().await,
            Err(AgentError::Result(ResultError::Failed(RunFailure::Cancelled)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_step_waits_for_slow_and_incremental_tools() {
        let model = model(vec![MockStep::events(vec![
            tool_call("call-1", "slow", "{}"),
            tool_call("call-2", "progress", "{}"),
            finish(FinishReason::ToolCalls, Usage::new(4, 2)),
        ])]);
        let tools = ToolSet::new()
            .with(Tool::new("slow").execute_async(|_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("slow-done"))
            }))
            .with(Tool::new("progress").executor(Arc::new(
                |_input: Value, _options: crate::tool::ToolCallOptions| {
                    let loading = stream::once(async {
                        Ok::<_, ToolError>(ToolUpdate::Preliminary(json!({ "status": "loading" })))
                    });
                    let done = stream::once(async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok(ToolUpdate::Final(json!({ "status": "done" })))
                    });
                    ToolExecution::Incremental(Box::pin(loading.chain(done)))
                },
            )));
        let result = StreamText::builder(model)
            .prompt("hi")
            .tools(tools)
            .start()
            .expect("start");

        let started = tokio::time::Instant::now();
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert!(started.elapsed() >= Duration::from_secs(5));

        let results: Vec<(usize, &ToolResult)> = events
            .iter()
            .enumerate()
            .filter_map(|(index, event)| match event {
                StreamEvent::ToolResult(result) => Some((index, result)),
                _ => None,
            })
            .collect();
        let flags: Vec<(&str, bool)> = results
            .iter()
            .map(|(_, result)| (result.tool_call_id.as_str(), result.preliminary))
            .collect();
        assert_eq!(
            flags,
            vec![("call-2", true), ("call-2", false), ("call-1", false)]
        );
        let finish_step_at = events
            .iter()
            .position(|event| matches!(event, StreamEvent::FinishStep { .. }))
            .expect("finish step");
        assert!(results.iter().all(|(index, _)| *index < finish_step_at));
        assert_eq!(events.last().map(StreamEvent::kind), Some("finish"));

        let steps = result.steps().await.expect("steps");
        let recorded = steps[0].tool_results();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|result| !result.preliminary));

        let messages = result.response().await.expect("response").messages;
        let Some(ModelMessage::Tool { content }) = messages.last() else {
            panic!("expected tool message last");
        };
        let mut outputs: Vec<(String, ToolResultOutput)> = content
            .iter()
            .filter_map(|part| match part {
                ToolMessagePart::ToolResult {
                    tool_call_id,
                    output,
                    ..
                } => Some((tool_call_id.clone(), output.clone())),
                _ => None,
            })
            .collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            outputs,
            vec![
                ("call-1".to_string(), ToolResultOutput::Text("slow-done".into())),
                (
                    "call-2".to_string(),
                    ToolResultOutput::Json(json!({ "status": "done" }))
                ),
            ]
        );
    }

    #[tokio::test]
    async fn repaired_tool_call_is_executed() {
        let executions = Arc::new(AtomicUsize::new(0));
        let repairs = Arc::new(Mutex::new(Vec::new()));
        let seen = repairs.clone();
        let result = StreamText::builder(model(vec![MockStep::events(vec![
            tool_call("call-1", "tool1", "value: value"),
            finish(FinishReason::ToolCalls, Usage::default()),
        ])]))
        .prompt("hi")
        .tools(ToolSet::new().with(tool1(executions.clone())))
        .repair_tool_call(move |repair| {
            seen.lock()
                .expect("lock")
                .push((repair.tool_call.input.clone(), repair.error.is_validation()));
            Some(RawToolCall {
                input: r#"{"value":"value"}"#.into(),
                ..repair.tool_call.clone()
            })
        })
        .start()
        .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let call = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .expect("tool call");
        assert!(!call.invalid);
        assert_eq!(call.input, json!({ "value": "value" }));
        assert!(!events.iter().any(|event| matches!(event, StreamEvent::ToolError(_))));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(
            *repairs.lock().expect("lock"),
            vec![("value: value".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn two_step_run_sums_usage_and_orders_transcript() {
        let executions = Arc::new(AtomicUsize::new(0));
        let step_one = MockStep::events(vec![
            tool_call("call-1", "tool1", r#"{"value":"value"}"#),
            finish(FinishReason::ToolCalls, Usage::new(10, 5)),
        ]);
        let mut step_two = text_events("1", &["Done."]);
        step_two.push(finish(FinishReason::Stop, Usage::new(20, 7)));
        let model = model(vec![step_one, MockStep::events(step_two)]);
        let finished_steps = Arc::new(AtomicUsize::new(0));
        let step_counter = finished_steps.clone();

        let result = StreamText::builder(model.clone())
            .prompt("hi")
            .tools(ToolSet::new().with(tool1(executions)))
            .stop_when(step_count_is(5))
            .on_step_finish(move |_| {
                step_counter.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .expect("start");

        let steps = result.steps().await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].finish_reason, FinishReason::ToolCalls);
        assert_eq!(steps[1].finish_reason, FinishReason::Stop);
        assert_eq!(
            result.total_usage().await.expect("usage"),
            Usage::new(10, 5) + Usage::new(20, 7)
        );
        assert_eq!(result.usage().await.expect("usage"), Usage::new(20, 7));
        assert_eq!(finished_steps.load(Ordering::SeqCst), 2);

        let messages = result.response().await.expect("response").messages;
        let roles: Vec<&str> = messages
            .iter()
            .map(|message| match message {
                ModelMessage::System { .. } => "system",
                ModelMessage::User { .. } => "user",
                ModelMessage::Assistant { .. } => "assistant",
                ModelMessage::Tool { .. } => "tool",
            })
            .collect();
        assert_eq!(roles, vec!["assistant", "tool", "assistant"]);

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].step_number, 1);
        assert_eq!(calls[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn stop_condition_ends_loop_after_matching_tool_call() {
        let model = model(vec![MockStep::events(vec![
            tool_call("call-1", "tool1", r#"{"value":"value"}"#),
            finish(FinishReason::ToolCalls, Usage::default()),
        ])]);
        let result = StreamText::builder(model.clone())
            .prompt("hi")
            .tools(ToolSet::new().with(tool1(Arc::new(AtomicUsize::new(0)))))
            .stop_when(step_count_is(5))
            .stop_when(has_tool_call("tool1"))
            .start()
            .expect("start");
        assert_eq!(result.steps().await.expect("steps").len(), 1);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn approval_required_call_never_executes_and_stops_loop() {
        let executions = Arc::new(AtomicUsize::new(0));
        let model = model(vec![MockStep::events(vec![
            tool_call("call-1", "tool1", r#"{"value":"value"}"#),
            finish(FinishReason::ToolCalls, Usage::default()),
        ])]);
        let result = StreamText::builder(model.clone())
            .prompt("hi")
            .tools(
                ToolSet::new().with(tool1(executions.clone()).needs_approval(NeedsApproval::Always)),
            )
            .stop_when(step_count_is(5))
            .id_generator(counter_generator("id"))
            .start()
            .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let tool_events: Vec<&StreamEvent> = events
            .iter()
            .filter(|event| event.kind().starts_with("tool-"))
            .collect();
        assert_eq!(tool_events.len(), 2);
        assert!(matches!(tool_events[0], StreamEvent::ToolCall(_)));
        let StreamEvent::ToolApprovalRequest(request) = tool_events[1] else {
            panic!("expected approval request");
        };
        assert_eq!(request.approval_id, "id-1");
        assert_eq!(request.tool_call.tool_call_id, "call-1");
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        assert_eq!(model.call_count(), 1);
    }

    fn approval_history(approved: bool) -> Vec<ModelMessage> {
        vec![
            ModelMessage::user("pay"),
            ModelMessage::Assistant {
                content: vec![
                    AssistantPart::ToolCall {
                        tool_call_id: "call-1".into(),
                        tool_name: "tool1".into(),
                        input: json!({ "value": "value" }),
                        provider_executed: None,
                    },
                    AssistantPart::ToolApprovalRequest {
                        approval_id: "approval-1".into(),
                        tool_call_id: "call-1".into(),
                    },
                ],
            },
            ModelMessage::Tool {
                content: vec![ToolMessagePart::ToolApprovalResponse {
                    approval_id: "approval-1".into(),
                    approved,
                    reason: (!approved).then(|| "not now".to_string()),
                }],
            },
        ]
    }

    #[tokio::test]
    async fn approved_call_runs_before_first_step() {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut events = text_events("1", &["Paid."]);
        events.push(finish(FinishReason::Stop, Usage::default()));
        let model = model(vec![MockStep::events(events)]);
        let result = StreamText::builder(model.clone())
            .messages(approval_history(true))
            .tools(
                ToolSet::new().with(tool1(executions.clone()).needs_approval(NeedsApproval::Always)),
            )
            .start()
            .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let all = kinds(&events);
        assert_eq!(all[..3], ["start", "tool-result", "start-step"]);
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let sent = &model.calls()[0].messages;
        let Some(ModelMessage::Tool { content }) = sent.last() else {
            panic!("expected tool message last");
        };
        assert!(matches!(
            &content[0],
            ToolMessagePart::ToolResult { output: ToolResultOutput::Text(text), .. } if text == "value-result"
        ));
    }

    #[tokio::test]
    async fn cancelled_run_never_executes_approved_call() {
        let executions = Arc::new(AtomicUsize::new(0));
        let signal = CancellationToken::new();
        signal.cancel();
        let model = model(vec![hello_world()]);
        let result = StreamText::builder(model.clone())
            .messages(approval_history(true))
            .tools(
                ToolSet::new().with(tool1(executions.clone()).needs_approval(NeedsApproval::Always)),
            )
            .abort_signal(signal)
            .start()
            .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(kinds(&events), vec!["start", "abort"]);
        tokio::task::yield_now().await;
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn denied_call_emits_denial_and_skips_execution() {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut events = text_events("1", &["Okay."]);
        events.push(finish(FinishReason::Stop, Usage::default()));
        let model = model(vec![MockStep::events(events)]);
        let result = StreamText::builder(model.clone())
            .messages(approval_history(false))
            .tools(
                ToolSet::new().with(tool1(executions.clone()).needs_approval(NeedsApproval::Always)),
            )
            .start()
            .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(
            events[1],
            StreamEvent::ToolOutputDenied {
                tool_call_id: "call-1".into(),
                tool_name: "tool1".into(),
                reason: Some("not now".into()),
            }
        );
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        let sent = &model.calls()[0].messages;
        assert!(matches!(
            sent.last(),
            Some(ModelMessage::Tool { content }) if matches!(
                &content[0],
                ToolMessagePart::ToolResult { output: ToolResultOutput::ExecutionDenied(Some(_)), .. }
            )
        ));
    }

    #[tokio::test]
    async fn invalid_tool_input_pairs_call_with_error() {
        let executions = Arc::new(AtomicUsize::new(0));
        let result = StreamText::builder(model(vec![MockStep::events(vec![
            tool_call("call-1", "tool1", r#"{"other":1}"#),
            finish(FinishReason::ToolCalls, Usage::default()),
        ])]))
        .prompt("hi")
        .tools(ToolSet::new().with(tool1(executions.clone())))
        .start()
        .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let call = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .expect("tool call");
        assert!(call.invalid);
        let failure = events
            .iter()
            .find_map(|event| match event {
                StreamEvent::ToolError(failure) => Some(failure.clone()),
                _ => None,
            })
            .expect("tool error");
        assert!(failure.error.is_validation());
        assert_eq!(executions.load(Ordering::SeqCst), 0);
        assert_eq!(events.last().map(StreamEvent::kind), Some("finish"));
    }

    #[tokio::test]
    async fn tool_failure_is_local_to_the_call() {
        let failing = Tool::new("flaky")
            .execute_sync(|_input, _options| Err(ToolError::execution("upstream down")));
        let mut step_two = text_events("1", &["Sorry."]);
        step_two.push(finish(FinishReason::Stop, Usage::default()));
        let result = StreamText::builder(model(vec![
            MockStep::events(vec![
                tool_call("call-1", "flaky", "{}"),
                finish(FinishReason::ToolCalls, Usage::default()),
            ]),
            MockStep::events(step_two),
        ]))
        .prompt("hi")
        .tools(ToolSet::new().with(failing))
        .stop_when(step_count_is(3))
        .start()
        .expect("start");

        let steps = result.steps().await.expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].tool_errors().len(), 1);
        assert_eq!(result.text().await.expect("text"), "Sorry.");
    }

    #[tokio::test]
    async fn model_call_error_rejects_results_and_reports_once() {
        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = errors.clone();
        let result = StreamText::builder(model(vec![MockStep::CallError(ModelError::provider(
            "bad request",
            Some(400),
        ))]))
        .prompt("hi")
        .on_error(move |_| {
            error_count.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .expect("start");

        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        assert_eq!(kinds(&events), vec!["start", "error"]);
        assert!(matches!(
            &events[1],
            StreamEvent::Error { error: StreamError::Model(ModelError::Provider { status_code: Some(400), .. }) }
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let err = match result.text().await {
            Ok(_) => panic!("model failure should reject results"),
            Err(err) => err,
        };
        assert!(matches!(
            err,
            AgentError::Result(ResultError::Failed(RunFailure::Model { .. }))
        ));
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_trailing_events() {
        let mut events = text_events("1", &["partial"]);
        events.push(raw_error(json!({ "message": "overloaded" })));
        events.push(finish(FinishReason::Stop, Usage::default()));
        let result = StreamText::builder(model(vec![MockStep::events(events)]))
            .prompt("hi")
            .start()
            .expect("start");
        let events: Vec<StreamEvent> = result.full_stream().collect().await;
        let all = kinds(&events);
        assert_eq!(all[all.len() - 3..], ["error", "finish-step", "finish"]);
        assert_eq!(result.text().await.expect("text"), "partial");
    }

    #[tokio::test]
    async fn cancelled_consumer_does_not_fire_finish_or_disturb_others() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");
        let fired = Arc::new(AtomicUsize::new(0));
        let cancelled_counter = fired.clone();
        let drained_counter = fired.clone();
        let mut cancelled = result.full_stream().on_finish(move |_| {
            cancelled_counter.fetch_add(100, Ordering::SeqCst);
        });
        let drained = result.full_stream().on_finish(move |finish| {
            assert!(!finish.aborted);
            assert_eq!(finish.transcript.steps.len(), 1);
            drained_counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(cancelled.next().await, Some(StreamEvent::Start));
        cancelled.cancel();
        let events: Vec<StreamEvent> = drained.collect().await;
        assert_eq!(events.last().map(StreamEvent::kind), Some("finish"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.transcript().steps.len(), 1);
    }

    #[tokio::test]
    async fn wire_stream_finish_fires_only_when_drained() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");
        let fired = Arc::new(AtomicUsize::new(0));

        let early = fired.clone();
        let mut partial = result.wire_stream(WireStreamOptions::default().on_finish(move |_| {
            early.fetch_add(100, Ordering::SeqCst);
        }));
        assert_eq!(
            partial.next().await,
            Some(WireChunk::Start {
                message_id: None,
                message_metadata: None,
            })
        );
        drop(partial);

        let full = fired.clone();
        let chunks: Vec<WireChunk> = result
            .wire_stream(WireStreamOptions::default().on_finish(move |finish| {
                assert_eq!(finish.transcript.steps[0].text(), "Hello, world!");
                full.fetch_add(1, Ordering::SeqCst);
            }))
            .collect()
            .await;
        assert_eq!(
            chunks.last(),
            Some(&WireChunk::Finish {
                message_metadata: None
            })
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wire_response_masks_errors_and_ends_with_done() {
        let result = StreamText::builder(model(vec![MockStep::CallError(ModelError::provider(
            "secret upstream detail",
            Some(400),
        ))]))
        .prompt("hi")
        .start()
        .expect("start");
        let response = result.to_wire_response(ResponseInit::default(), WireStreamOptions::default());
        assert_eq!(response.headers["content-type"], "text/event-stream");
        let frames: Vec<Bytes> = response.body.collect().await;
        assert_eq!(frames.last().map(|frame| &frame[..]), Some(SSE_DONE));

        let mut decoder = SseDecoder::default();
        let mut chunks = Vec::new();
        for frame in &frames {
            for decoded in decoder.push_chunk(frame) {
                if let Some(chunk) = decoded.chunk().expect("valid chunk") {
                    chunks.push(chunk);
                }
            }
        }
        assert!(chunks.contains(&WireChunk::Error {
            error_text: "An error occurred.".into()
        }));
    }

    #[tokio::test]
    async fn text_response_streams_plain_text() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");
        let response = result.to_text_response(ResponseInit::default());
        assert_eq!(
            response.headers["content-type"],
            "text/plain; charset=utf-8"
        );
        let body: Vec<Bytes> = response.body.collect().await;
        assert_eq!(body.concat(), b"Hello, world!".to_vec());
    }

    #[tokio::test]
    async fn prepare_step_overrides_system_and_tools() {
        let model = model(vec![hello_world()]);
        let result = StreamText::builder(model.clone())
            .system("default")
            .prompt("hi")
            .tools(
                ToolSet::new()
                    .with(Tool::new("a"))
                    .with(Tool::new("b")),
            )
            .prepare_step(|ctx| {
                assert_eq!(ctx.step_number, 0);
                Some(StepOverrides {
                    system: Some("step zero".into()),
                    active_tools: Some(vec!["b".into()]),
                    tool_choice: Some(ToolChoice::Required),
                    ..StepOverrides::default()
                })
            })
            .start()
            .expect("start");
        result.consume().await;
        let call = &model.calls()[0];
        assert_eq!(call.system.as_deref(), Some("step zero"));
        assert_eq!(call.tools.len(), 1);
        assert_eq!(call.tools[0].name, "b");
        assert_eq!(call.tool_choice, ToolChoice::Required);
    }

    #[tokio::test]
    async fn smooth_stream_transform_applies_before_fan_out() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .transform(SmoothStream::new().delay(None))
            .start()
            .expect("start");
        let deltas: Vec<String> = result.text_stream().collect().await;
        assert_eq!(deltas, vec!["Hello, ", "world!"]);
        assert_eq!(result.text().await.expect("text"), "Hello, world!");
    }

    #[tokio::test]
    async fn object_output_streams_partials_and_parses_final_text() {
        let schema = json!({
            "type": "object",
            "properties": { "city": { "type": "string" }, "days": { "type": "array" } },
            "required": ["city"]
        });
        let mut events = text_events("1", &[r#"{"city": "Os"#, r#"lo", "days": [1"#, ", 2]}"]);
        events.push(finish(FinishReason::Stop, Usage::default()));
        let model = model(vec![MockStep::events(events)]);
        let result = StreamText::builder(model.clone())
            .prompt("weather")
            .output(Output::object(ObjectSchema::new(schema.clone())))
            .start()
            .expect("start");

        let partials: Vec<Value> = result
            .partial_output_stream()
            .expect("output configured")
            .collect()
            .await;
        assert_eq!(
            partials,
            vec![
                json!({ "city": "Os" }),
                json!({ "city": "Oslo", "days": [1] }),
                json!({ "city": "Oslo", "days": [1, 2] }),
            ]
        );
        assert_eq!(
            result.output().await.expect("output"),
            json!({ "city": "Oslo", "days": [1, 2] })
        );
        assert_eq!(model.calls()[0].response_format, Some(schema));
    }

    #[tokio::test]
    async fn output_accessors_need_an_output() {
        let result = StreamText::builder(model(vec![hello_world()]))
            .prompt("hi")
            .start()
            .expect("start");
        assert!(matches!(
            result.partial_output_stream(),
            Err(AgentError::Validation(msg)) if msg.contains("no output specified")
        ));
        assert!(matches!(result.output().await, Err(AgentError::Validation(_))));
        assert_eq!(result.text().await.expect("text"), "Hello, world!");
    }

    #[tokio::test]
    async fn transient_call_errors_are_retried() {
        let model = model(vec![
            MockStep::CallError(ModelError::transport("connection reset")),
            hello_world(),
        ]);
        let result = StreamText::builder(model.clone())
            .prompt("hi")
            .retry_policy(RetryPolicy::exponential(2, 1, 1.0))
            .start()
            .expect("start");
        assert_eq!(result.text().await.expect("text"), "Hello, world!");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn validation_rejects_bad_builders() {
        let err = match StreamText::builder(model(Vec::new())).start() {
            Ok(_) => panic!("missing prompt should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AgentError::Validation(msg) if msg.contains("prompt or at least one message")));

        let err = match StreamText::builder(model(Vec::new()))
            .prompt("hi")
            .messages(vec![ModelMessage::user("hi")])
            .start()
        {
            Ok(_) => panic!("prompt and messages should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AgentError::Validation(_)));

        let err = match StreamText::builder(model(Vec::new()))
            .prompt("hi")
            .active_tools(["missing"])
            .start()
        {
            Ok(_) => panic!("unknown active tool should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, AgentError::Validation(msg) if msg.contains("missing")));
    }
}
