use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::message::ModelMessage;
use crate::model::ToolDefinition;

/// Describes and validates a tool's input.
pub trait InputSchema: Send + Sync {
    /// JSON schema sent to the model.
    fn json_schema(&self) -> Value;

    /// Checks parsed input, returning the value handed to the executor.
    fn validate(&self, input: Value) -> Result<Value, String>;
}

/// Accepts any JSON value.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyInput;

impl InputSchema for AnyInput {
    fn json_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn validate(&self, input: Value) -> Result<Value, String> {
        Ok(input)
    }
}

/// Object schema with `required` keys and primitive `type` checks on `properties`.
#[derive(Clone, Debug)]
pub struct ObjectSchema {
    schema: Value,
}

impl ObjectSchema {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

impl InputSchema for ObjectSchema {
    fn json_schema(&self) -> Value {
        self.schema.clone()
    }

    fn validate(&self, input: Value) -> Result<Value, String> {
        let Some(object) = input.as_object() else {
            return Err("expected a JSON object".into());
        };
        if let Some(required) = self.schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(format!("missing required property `{key}`"));
                }
            }
        }
        if let Some(properties) = self.schema.get("properties").and_then(Value::as_object) {
            for (key, property) in properties {
                let (Some(value), Some(expected)) =
                    (object.get(key), property.get("type").and_then(Value::as_str))
                else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(format!("property `{key}` must be of type {expected}"));
                }
            }
        }
        Ok(input)
    }
}

/// Parses raw model input text. Blank input means an empty object.
pub fn parse_tool_input(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|err| format!("input is not valid JSON: {err}"))
}

/// Context handed to a tool executor.
#[derive(Clone, Debug)]
pub struct ToolCallOptions {
    pub tool_call_id: String,
    /// Conversation history the model saw when it made the call.
    pub messages: Vec<ModelMessage>,
    /// Fires when the run is cancelled.
    pub cancellation: CancellationToken,
    /// Opaque caller context, passed through untouched.
    pub context: Value,
}

/// One value from an incremental executor.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolUpdate {
    Preliminary(Value),
    Final(Value),
}

/// The shapes a tool execution can take.
pub enum ToolExecution {
    /// Value produced synchronously.
    Ready(Result<Value, ToolError>),
    /// Single value produced later.
    Deferred(BoxFuture<'static, Result<Value, ToolError>>),
    /// Preliminary values followed by exactly one final value.
    Incremental(BoxStream<'static, Result<ToolUpdate, ToolError>>),
}

impl ToolExecution {
    pub fn ready(value: Value) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl fmt::Debug for ToolExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Incremental(_) => f.write_str("Incremental(..)"),
        }
    }
}

/// Runs a tool. Executors only return values; they never touch run state.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, input: Value, options: ToolCallOptions) -> ToolExecution;
}

impl<F> ToolExecutor for F
where
    F: Fn(Value, ToolCallOptions) -> ToolExecution + Send + Sync,
{
    fn execute(&self, input: Value, options: ToolCallOptions) -> ToolExecution {
        self(input, options)
    }
}

/// Whether a call must be approved before it runs.
#[derive(Clone, Default)]
pub enum NeedsApproval {
    #[default]
    Never,
    Always,
    /// Predicate over the call input and the run context.
    When(Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>),
}

impl NeedsApproval {
    pub fn check(&self, input: &Value, context: &Value) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(input, context),
        }
    }
}

impl fmt::Debug for NeedsApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

pub type InputStartHook = Arc<dyn Fn(&ToolCallOptions) + Send + Sync>;
pub type InputDeltaHook = Arc<dyn Fn(&str, &ToolCallOptions) + Send + Sync>;
pub type InputAvailableHook = Arc<dyn Fn(&Value, &ToolCallOptions) + Send + Sync>;

/// Observers of a call's input as the model streams it.
#[derive(Clone, Default)]
pub struct InputHooks {
    pub on_start: Option<InputStartHook>,
    pub on_delta: Option<InputDeltaHook>,
    /// Fires once per valid call, before approval gating and execution.
    pub on_available: Option<InputAvailableHook>,
}

impl InputHooks {
    pub fn is_empty(&self) -> bool {
        self.on_start.is_none() && self.on_delta.is_none() && self.on_available.is_none()
    }
}

/// A named capability the model may call.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: Option<String>,
    input_schema: Arc<dyn InputSchema>,
    executor: Option<Arc<dyn ToolExecutor>>,
    needs_approval: NeedsApproval,
    dynamic: bool,
    provider_executed: bool,
    input_hooks: InputHooks,
}

impl Tool {
    /// Creates a tool that accepts any input and has no executor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: Arc::new(AnyInput),
            executor: None,
            needs_approval: NeedsApproval::Never,
            dynamic: false,
            provider_executed: false,
            input_hooks: InputHooks::default(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: impl InputSchema + 'static) -> Self {
        self.input_schema = Arc::new(schema);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets an executor that returns a value immediately.
    pub fn execute_sync<F>(self, f: F) -> Self
    where
        F: Fn(Value, ToolCallOptions) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.executor(Arc::new(move |input: Value, options: ToolCallOptions| {
            ToolExecution::Ready(f(input, options))
        }))
    }

    /// Sets an async executor.
    pub fn execute_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Value, ToolCallOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.executor(Arc::new(move |input: Value, options: ToolCallOptions| {
            ToolExecution::Deferred(Box::pin(f(input, options)))
        }))
    }

    /// Sets an async executor whose output is any serializable value.
    ///
    /// Outputs that do not serialize to JSON fail the call with
    /// [`ToolError::Serialization`].
    pub fn execute_typed<F, Fut, T>(self, f: F) -> Self
    where
        F: Fn(Value, ToolCallOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ToolError>> + Send + 'static,
        T: serde::Serialize + Send + 'static,
    {
        self.execute_async(move |input, options| {
            let output = f(input, options);
            async move {
                let output = output.await?;
                serde_json::to_value(output).map_err(|err| ToolError::Serialization(err.to_string()))
            }
        })
    }

    pub fn needs_approval(mut self, needs_approval: NeedsApproval) -> Self {
        self.needs_approval = needs_approval;
        self
    }

    /// Marks the tool as dynamic: its input and output types are not known statically.
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Marks the tool as executed by the provider; results arrive in the raw stream.
    pub fn provider_executed(mut self, provider_executed: bool) -> Self {
        self.provider_executed = provider_executed;
        self
    }

    /// Called when the model starts streaming input for this tool.
    pub fn on_input_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&ToolCallOptions) + Send + Sync + 'static,
    {
        self.input_hooks.on_start = Some(Arc::new(f));
        self
    }

    /// Called for every streamed chunk of input text.
    pub fn on_input_delta<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &ToolCallOptions) + Send + Sync + 'static,
    {
        self.input_hooks.on_delta = Some(Arc::new(f));
        self
    }

    /// Called with the parsed input once a complete call passed validation.
    pub fn on_input_available<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &ToolCallOptions) + Send + Sync + 'static,
    {
        self.input_hooks.on_available = Some(Arc::new(f));
        self
    }

    pub fn input_hooks(&self) -> &InputHooks {
        &self.input_hooks
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_provider_executed(&self) -> bool {
        self.provider_executed
    }

    pub fn executor_ref(&self) -> Option<&Arc<dyn ToolExecutor>> {
        self.executor.as_ref()
    }

    pub fn requires_approval(&self, input: &Value, context: &Value) -> bool {
        self.needs_approval.check(input, context)
    }

    pub fn validate(&self, input: Value) -> Result<Value, String> {
        self.input_schema.validate(input)
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.json_schema(),
            provider_executed: self.provider_executed,
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("has_executor", &self.executor.is_some())
            .field("needs_approval", &self.needs_approval)
            .field("dynamic", &self.dynamic)
            .field("provider_executed", &self.provider_executed)
            .field("has_input_hooks", &!self.input_hooks.is_empty())
            .finish()
    }
}

/// Tools available to a run, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, Tool>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, replacing any tool with the same name.
    pub fn with(mut self, tool: Tool) -> Self {
        self.insert(tool);
        self
    }

    pub fn insert(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Definitions sent to the model, limited to `active` when given.
    pub fn definitions(&self, active: Option<&[String]>) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|tool| active.is_none_or(|names| names.iter().any(|n| n == &tool.name)))
            .map(Tool::definition)
            .collect()
    }
}
