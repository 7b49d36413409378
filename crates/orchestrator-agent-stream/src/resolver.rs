use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::content::{ToolApprovalRequest, ToolCall, ToolFailure, ToolResult};
use crate::errors::ToolError;
use crate::id::IdGenerator;
use crate::message::ModelMessage;
use crate::stream::StreamEvent;
use crate::tool::{
    ToolCallOptions, ToolExecution, ToolExecutor, ToolSet, ToolUpdate, parse_tool_input,
};

/// Approval state of a tracked call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalState {
    NotRequired,
    Pending,
    Approved,
    Denied,
}

/// Execution status of a tracked call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Input text is still arriving.
    Streaming,
    /// Complete call received; nothing to run (no executor).
    Received,
    Invalid,
    Executing,
    AwaitingApproval,
    ProviderExecuted,
}

/// Per-call bookkeeping for the step in progress.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallState {
    pub tool_call_id: String,
    pub tool_name: String,
    pub dynamic: bool,
    pub provider_executed: bool,
    pub input_text: String,
    pub parsed_input: Option<Value>,
    pub approval: ApprovalState,
    pub status: CallStatus,
}

/// A complete tool call as reported by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct RawToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: String,
    pub provider_executed: bool,
    pub provider_metadata: Option<Value>,
}

/// What a repair hook sees for a call that failed parsing or validation.
pub struct ToolCallRepair<'a> {
    pub tool_call: &'a RawToolCall,
    pub error: &'a ToolError,
    pub tools: &'a ToolSet,
    pub messages: &'a [ModelMessage],
}

/// Returns a corrected call, or `None` to keep the original failure.
pub type RepairToolCall = Arc<dyn Fn(&ToolCallRepair<'_>) -> Option<RawToolCall> + Send + Sync>;

/// Parses and validates a raw call against the tool set.
///
/// Failures produce a call marked `invalid` (and `dynamic`) carrying the
/// error; such calls are never executed.
pub fn parse_tool_call(tools: &ToolSet, raw: RawToolCall) -> ToolCall {
    let tool = tools.get(&raw.tool_name);
    let invalid = |input: Value, error: ToolError| ToolCall {
        tool_call_id: raw.tool_call_id.clone(),
        tool_name: raw.tool_name.clone(),
        input,
        dynamic: true,
        provider_executed: raw.provider_executed,
        invalid: true,
        error: Some(error),
        provider_metadata: raw.provider_metadata.clone(),
    };

    if tool.is_none() && !raw.provider_executed {
        return invalid(
            parse_tool_input(&raw.input).unwrap_or_else(|_| Value::String(raw.input.clone())),
            ToolError::NoSuchTool {
                tool_name: raw.tool_name.clone(),
                available: tools.names().join(", "),
            },
        );
    }

    let parsed = match parse_tool_input(&raw.input) {
        Ok(value) => value,
        Err(message) => {
            return invalid(
                Value::String(raw.input.clone()),
                ToolError::InvalidInput {
                    tool_name: raw.tool_name.clone(),
                    message,
                },
            );
        }
    };

    let input = match tool {
        Some(tool) => match tool.validate(parsed.clone()) {
            Ok(value) => value,
            Err(message) => {
                return invalid(
                    parsed,
                    ToolError::InvalidInput {
                        tool_name: raw.tool_name.clone(),
                        message,
                    },
                );
            }
        },
        None => parsed,
    };

    ToolCall {
        tool_call_id: raw.tool_call_id,
        tool_name: raw.tool_name,
        input,
        dynamic: tool.is_none_or(|tool| tool.is_dynamic()),
        provider_executed: raw.provider_executed,
        invalid: false,
        error: None,
        provider_metadata: raw.provider_metadata,
    }
}

#[derive(Clone, Debug)]
struct CallMeta {
    tool_call_id: String,
    tool_name: String,
    input: Value,
    dynamic: bool,
}

impl CallMeta {
    fn of(call: &ToolCall) -> Self {
        Self {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.tool_name.clone(),
            input: call.input.clone(),
            dynamic: call.dynamic,
        }
    }

    fn result(&self, output: Value, preliminary: bool) -> ToolResult {
        ToolResult {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            input: self.input.clone(),
            output,
            dynamic: self.dynamic,
            provider_executed: false,
            preliminary,
        }
    }

    fn failure(&self, error: ToolError) -> ToolFailure {
        ToolFailure {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            input: self.input.clone(),
            error,
            dynamic: self.dynamic,
            provider_executed: false,
        }
    }
}

enum Settlement {
    Preliminary(ToolResult),
    Final(ToolResult),
    Failed(ToolFailure),
}

impl Settlement {
    fn final_id(&self) -> Option<&str> {
        match self {
            Self::Preliminary(_) => None,
            Self::Final(result) => Some(&result.tool_call_id),
            Self::Failed(failure) => Some(&failure.tool_call_id),
        }
    }

    fn into_event(self) -> StreamEvent {
        match self {
            Self::Preliminary(result) | Self::Final(result) => StreamEvent::ToolResult(result),
            Self::Failed(failure) => StreamEvent::ToolError(failure),
        }
    }
}

/// Turns raw tool traffic into canonical events and runs client tools.
///
/// Executions are spawned tasks that report back over a channel; they never
/// touch the resolver's state. Outstanding executions are tracked so a step
/// can wait for all of them before it is finished.
pub struct ToolCallResolver {
    tools: Arc<ToolSet>,
    calls: HashMap<String, ToolCallState>,
    outstanding: HashSet<String>,
    settle_tx: mpsc::UnboundedSender<Settlement>,
    settle_rx: mpsc::UnboundedReceiver<Settlement>,
    cancellation: CancellationToken,
    context: Value,
    generate_id: IdGenerator,
    repair: Option<RepairToolCall>,
}

impl ToolCallResolver {
    pub fn new(
        tools: Arc<ToolSet>,
        cancellation: CancellationToken,
        context: Value,
        generate_id: IdGenerator,
    ) -> Self {
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        Self {
            tools,
            calls: HashMap::new(),
            outstanding: HashSet::new(),
            settle_tx,
            settle_rx,
            cancellation,
            context,
            generate_id,
            repair: None,
        }
    }

    /// Invalid calls are offered to `repair` before they are reported.
    pub fn with_repair(mut self, repair: Option<RepairToolCall>) -> Self {
        self.repair = repair;
        self
    }

    /// Unknown tools are reported as dynamic.
    pub fn is_dynamic(&self, tool_name: &str) -> bool {
        self.tools
            .get(tool_name)
            .is_none_or(|tool| tool.is_dynamic())
    }

    pub fn call_state(&self, tool_call_id: &str) -> Option<&ToolCallState> {
        self.calls.get(tool_call_id)
    }

    fn call_options(&self, tool_call_id: &str, messages: &[ModelMessage]) -> ToolCallOptions {
        ToolCallOptions {
            tool_call_id: tool_call_id.to_string(),
            messages: messages.to_vec(),
            cancellation: self.cancellation.clone(),
            context: self.context.clone(),
        }
    }

    pub fn on_input_start(
        &mut self,
        id: String,
        tool_name: String,
        provider_executed: bool,
        messages: &[ModelMessage],
    ) -> StreamEvent {
        if let Some(hook) = self
            .tools
            .get(&tool_name)
            .and_then(|tool| tool.input_hooks().on_start.clone())
        {
            hook(&self.call_options(&id, messages));
        }
        let dynamic = self.is_dynamic(&tool_name);
        self.calls.insert(
            id.clone(),
            ToolCallState {
                tool_call_id: id.clone(),
                tool_name: tool_name.clone(),
                dynamic,
                provider_executed,
                input_text: String::new(),
                parsed_input: None,
                approval: ApprovalState::NotRequired,
                status: CallStatus::Streaming,
            },
        );
        StreamEvent::ToolInputStart {
            dynamic,
            id,
            tool_name,
            provider_executed,
        }
    }

    pub fn on_input_delta(
        &mut self,
        id: String,
        delta: String,
        messages: &[ModelMessage],
    ) -> StreamEvent {
        let Some(state) = self.calls.get_mut(&id) else {
            return StreamEvent::ToolInputDelta { id, delta };
        };
        state.input_text.push_str(&delta);
        let hook = self
            .tools
            .get(&state.tool_name)
            .and_then(|tool| tool.input_hooks().on_delta.clone());
        if let Some(hook) = hook {
            hook(&delta, &self.call_options(&id, messages));
        }
        StreamEvent::ToolInputDelta { id, delta }
    }

    pub fn on_input_end(&mut self, id: String) -> StreamEvent {
        StreamEvent::ToolInputEnd { id }
    }

    /// Handles a complete call: emits `tool-call`, then either an error
    /// (invalid input), an approval request, or starts the execution.
    pub fn on_tool_call(&mut self, raw: RawToolCall, messages: &[ModelMessage]) -> Vec<StreamEvent> {
        let input_text = raw.input.clone();
        let call = self.parse_with_repair(raw, messages);
        let mut events = vec![StreamEvent::ToolCall(call.clone())];

        let state = self
            .calls
            .entry(call.tool_call_id.clone())
            .or_insert_with(|| ToolCallState {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                dynamic: call.dynamic,
                provider_executed: call.provider_executed,
                input_text: String::new(),
                parsed_input: None,
                approval: ApprovalState::NotRequired,
                status: CallStatus::Received,
            });
        state.tool_name = call.tool_name.clone();
        state.dynamic = call.dynamic;
        state.provider_executed = call.provider_executed;
        state.input_text = input_text;
        state.parsed_input = Some(call.input.clone());
        state.status = CallStatus::Received;

        if call.invalid {
            state.status = CallStatus::Invalid;
            let error = call
                .error
                .clone()
                .unwrap_or_else(|| ToolError::execution("invalid tool call"));
            debug!(tool_call_id = %call.tool_call_id, tool_name = %call.tool_name, error = %error, "invalid tool call");
            events.push(StreamEvent::ToolError(ToolFailure {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: call.input.clone(),
                error,
                dynamic: true,
                provider_executed: call.provider_executed,
            }));
            return events;
        }

        if call.provider_executed {
            state.status = CallStatus::ProviderExecuted;
            return events;
        }

        let Some(tool) = self.tools.get(&call.tool_name).cloned() else {
            return events;
        };

        if let Some(hook) = &tool.input_hooks().on_available {
            hook(&call.input, &self.call_options(&call.tool_call_id, messages));
        }

        let Some(state) = self.calls.get_mut(&call.tool_call_id) else {
            return events;
        };
        if tool.requires_approval(&call.input, &self.context) {
            state.approval = ApprovalState::Pending;
            state.status = CallStatus::AwaitingApproval;
            let approval_id = (self.generate_id)();
            debug!(tool_call_id = %call.tool_call_id, tool_name = %call.tool_name, approval_id = %approval_id, "tool call awaiting approval");
            events.push(StreamEvent::ToolApprovalRequest(ToolApprovalRequest {
                approval_id,
                tool_call: call,
            }));
            return events;
        }

        if let Some(executor) = tool.executor_ref().cloned()
            && self.spawn_execution(executor, &call, messages)
            && let Some(state) = self.calls.get_mut(&call.tool_call_id)
        {
            state.status = CallStatus::Executing;
        }
        events
    }

    /// Parses a raw call, handing validation failures to the repair hook first.
    fn parse_with_repair(&self, raw: RawToolCall, messages: &[ModelMessage]) -> ToolCall {
        let Some(repair) = &self.repair else {
            return parse_tool_call(&self.tools, raw);
        };
        let call = parse_tool_call(&self.tools, raw.clone());
        let Some(error) = call.error.as_ref().filter(|error| error.is_validation()) else {
            return call;
        };
        let request = ToolCallRepair {
            tool_call: &raw,
            error,
            tools: &self.tools,
            messages,
        };
        match repair(&request) {
            Some(repaired) => {
                debug!(tool_call_id = %repaired.tool_call_id, tool_name = %repaired.tool_name, "tool call repaired");
                parse_tool_call(&self.tools, repaired)
            }
            None => call,
        }
    }

    /// Runs a call whose approval was granted in an earlier invocation.
    /// Returns false when the tool has no executor or the run is cancelled.
    pub fn execute_approved(&mut self, call: &ToolCall, messages: &[ModelMessage]) -> bool {
        let Some(executor) = self
            .tools
            .get(&call.tool_name)
            .and_then(|tool| tool.executor_ref().cloned())
        else {
            return false;
        };
        if !self.spawn_execution(executor, call, messages) {
            return false;
        }
        self.calls.insert(
            call.tool_call_id.clone(),
            answered_state(call, ApprovalState::Approved, CallStatus::Executing),
        );
        true
    }

    /// Tracks a call whose approval was refused in an earlier invocation.
    pub fn record_denied(&mut self, call: &ToolCall) {
        self.calls.insert(
            call.tool_call_id.clone(),
            answered_state(call, ApprovalState::Denied, CallStatus::Received),
        );
    }

    /// Maps a provider-executed result to `tool-result` or `tool-error`.
    pub fn on_provider_result(
        &mut self,
        tool_call_id: String,
        tool_name: String,
        result: Value,
        is_error: bool,
    ) -> StreamEvent {
        let input = self
            .calls
            .remove(&tool_call_id)
            .and_then(|state| state.parsed_input)
            .unwrap_or(Value::Null);
        let dynamic = self.is_dynamic(&tool_name);
        if is_error {
            let message = result
                .as_str()
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| result.to_string());
            StreamEvent::ToolError(ToolFailure {
                tool_call_id,
                tool_name,
                input,
                error: ToolError::execution_with_details(message, result),
                dynamic,
                provider_executed: true,
            })
        } else {
            StreamEvent::ToolResult(ToolResult {
                tool_call_id,
                tool_name,
                input,
                output: result,
                dynamic,
                provider_executed: true,
                preliminary: false,
            })
        }
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Waits for the next execution update. Cancel-safe.
    ///
    /// Returns `None` only when nothing is outstanding.
    pub async fn next_settlement(&mut self) -> Option<StreamEvent> {
        if self.outstanding.is_empty() {
            return None;
        }
        let settlement = self.settle_rx.recv().await?;
        if let Some(id) = settlement.final_id() {
            self.outstanding.remove(id);
            self.calls.remove(id);
        }
        Some(settlement.into_event())
    }

    /// Forgets per-step bookkeeping. Outstanding executions are kept.
    pub fn finish_step(&mut self) {
        let outstanding = &self.outstanding;
        self.calls.retain(|id, _| outstanding.contains(id));
    }

    /// Starts an execution task. Nothing starts once the run is cancelled.
    fn spawn_execution(
        &mut self,
        executor: Arc<dyn ToolExecutor>,
        call: &ToolCall,
        messages: &[ModelMessage],
    ) -> bool {
        if self.cancellation.is_cancelled() {
            debug!(tool_call_id = %call.tool_call_id, tool_name = %call.tool_name, "run cancelled; tool execution skipped");
            return false;
        }
        let meta = CallMeta::of(call);
        let options = self.call_options(&call.tool_call_id, messages);
        let input = call.input.clone();
        let tx = self.settle_tx.clone();
        self.outstanding.insert(call.tool_call_id.clone());
        debug!(tool_call_id = %meta.tool_call_id, tool_name = %meta.tool_name, "tool execution started");

        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(run_execution(executor, &meta, input, options, &tx))
                .catch_unwind()
                .await;
            let settlement = match outcome {
                Ok(Ok(output)) => Settlement::Final(meta.result(output, false)),
                Ok(Err(error)) => Settlement::Failed(meta.failure(error)),
                Err(_) => Settlement::Failed(meta.failure(ToolError::execution(format!(
                    "tool `{}` panicked",
                    meta.tool_name
                )))),
            };
            let _ = tx.send(settlement);
        });
        true
    }
}

fn answered_state(call: &ToolCall, approval: ApprovalState, status: CallStatus) -> ToolCallState {
    ToolCallState {
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        dynamic: call.dynamic,
        provider_executed: call.provider_executed,
        input_text: call.input.to_string(),
        parsed_input: Some(call.input.clone()),
        approval,
        status,
    }
}

async fn run_execution(
    executor: Arc<dyn ToolExecutor>,
    meta: &CallMeta,
    input: Value,
    options: ToolCallOptions,
    tx: &mpsc::UnboundedSender<Settlement>,
) -> Result<Value, ToolError> {
    match executor.execute(input, options) {
        ToolExecution::Ready(result) => result,
        ToolExecution::Deferred(future) => future.await,
        ToolExecution::Incremental(mut updates) => {
            while let Some(update) = updates.next().await {
                match update? {
                    ToolUpdate::Preliminary(value) => {
                        let _ = tx.send(Settlement::Preliminary(meta.result(value, true)));
                    }
                    ToolUpdate::Final(value) => return Ok(value),
                }
            }
            Err(ToolError::execution(format!(
                "tool `{}` ended without a final value",
                meta.tool_name
            )))
        }
    }
}
