//! Common imports for typical usage.
//!
//! Re-exports the builder, result handle, and the types most callbacks and
//! consumers touch, so application code needs fewer import lines.
pub use crate::{
    AbortHandle, AgentError, CallSettings, ContentPart, FinishReason, LanguageModel,
    ModelMessage, NeedsApproval, ObjectSchema, Output, ResponseInit, RetryPolicy, RunOutcome,
    SmoothStream, StepResult, StreamEvent, StreamText, StreamTextResult, Tool, ToolChoice,
    ToolError, ToolSet, Usage, WireChunk, WireStreamOptions, has_tool_call, step_count_is,
};
