//! Streaming text generation with multi-step tool execution.
//!
//! A run calls a [`LanguageModel`] once per step, turns its raw events into a
//! canonical [`StreamEvent`] sequence, executes client tools as their calls
//! arrive, and keeps looping while every client call of the last step has an
//! output and no stop condition matched. Any number of consumers can read the
//! same run as full events, text deltas, or UI message stream chunks.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt as _;
//! use orchestrator_agent_stream::prelude::*;
//! use orchestrator_agent_stream::testing::{
//!     MockLanguageModel, MockStep, finish, stream_start, text_events,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), AgentError> {
//! let mut events = vec![stream_start()];
//! events.extend(text_events("t1", &["Hello", " world"]));
//! events.push(finish(FinishReason::Stop, Usage::new(2, 2)));
//! let model = Arc::new(MockLanguageModel::new(vec![MockStep::events(events)]));
//!
//! let result = StreamText::builder(model)
//!     .system("Answer briefly.")
//!     .prompt("Say hello")
//!     .start()?;
//!
//! let mut text = result.text_stream();
//! while let Some(delta) = text.next().await {
//!     print!("{delta}");
//! }
//! println!();
//! println!("usage: {:?}", result.total_usage().await?);
//! # Ok(())
//! # }
//! ```

/// Resolution of tool approvals answered in the incoming history.
pub mod approval;
/// Per-step content assembly from streamed part lifecycles.
pub mod assembler;
/// Fan-out of one run to independent consumers.
pub mod broadcast;
/// Abort handles, external signals, and timeouts.
pub mod cancel;
/// Step content parts and tool call/result records.
pub mod content;
/// Step loop that drives model calls and tool execution.
pub mod driver;
/// Public error types.
pub mod errors;
/// Id generators.
pub mod id;
/// Conversation messages sent to the model.
pub mod message;
/// Language model contract, call request, and raw events.
pub mod model;
/// Structured output parsing and partial output streams.
pub mod output;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Step and transcript recording.
pub mod recorder;
/// Final run outcome and once-resolved result handles.
pub mod registry;
/// Tool call parsing, execution, and approval gating.
pub mod resolver;
/// HTTP response helpers for SSE and plain text.
pub mod response;
/// Retry policy for establishing model calls.
pub mod retry;
/// Builder and result handle for a streamed run.
pub mod run;
/// Word and line smoothing of text deltas.
pub mod smooth;
/// Step results.
pub mod step;
/// Stop conditions for the step loop.
pub mod stop;
/// Canonical stream events.
pub mod stream;
/// Scripted language model for tests and demos.
pub mod testing;
/// Tool definitions, executors, and tool sets.
pub mod tool;
/// Event transform pipeline.
pub mod transform;
/// Token usage and finish reasons.
pub mod usage;
/// UI message stream chunks and SSE framing.
pub mod wire;

pub use broadcast::{ConsumerFinish, FullStream, SseBody, TextBody, TextStream, WireStream};
pub use cancel::AbortHandle;
pub use content::{
    ContentPart, GeneratedFile, Source, ToolApprovalRequest, ToolCall, ToolFailure, ToolResult,
};
pub use driver::{PrepareStepContext, StepOverrides};
pub use errors::{AgentError, ModelError, ResultError, RunFailure, StreamError, ToolError};
pub use message::{AssistantPart, ModelMessage, ToolMessagePart, ToolResultOutput, UserPart};
pub use model::{
    CallSettings, LanguageModel, ModelCallRequest, ModelResponseMeta, ModelStreamHandle,
    ProviderId, RawEvent, ToolChoice, ToolDefinition,
};
pub use observability::{LogConfig, init_observability};
pub use output::{Output, PartialOutputStream};
pub use recorder::TranscriptSnapshot;
pub use registry::{ResponseTranscript, ResultHandle, RunOutcome};
pub use resolver::{RawToolCall, ToolCallRepair};
pub use response::{ResponseInit, StreamResponse};
pub use retry::RetryPolicy;
pub use run::{StreamText, StreamTextBuilder, StreamTextResult};
pub use smooth::{Chunking, SmoothStream};
pub use step::StepResult;
pub use stop::{StopCondition, has_tool_call, step_count_is};
pub use stream::StreamEvent;
pub use tool::{NeedsApproval, ObjectSchema, Tool, ToolCallOptions, ToolExecution, ToolSet};
pub use transform::{Flow, StreamTransform, TransformContext, TransformOutput};
pub use usage::{FinishReason, Usage};
pub use wire::{SseDecoder, WireChunk, WireStreamOptions};
