use serde_json::Value;

/// Errors raised by a language model collaborator while establishing or
/// reading a raw stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Provider returned an application-level failure (HTTP status, auth, etc.).
    #[error("provider error: {message}")]
    Provider {
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Provider response shape or event sequencing was invalid.
    #[error("protocol error: {message}")]
    Protocol { message: String },
    /// The call observed the cancellation token and stopped.
    #[error("model call cancelled")]
    Cancelled,
}

impl ModelError {
    /// Creates a provider-level error.
    pub fn provider(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Provider {
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Provider { message, .. }
            | Self::Transport { message }
            | Self::Protocol { message } => message,
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether establishing the call again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Provider {
                status_code: Some(code),
                ..
            } => matches!(code, 408 | 409 | 429) || (500..600).contains(code),
            _ => false,
        }
    }
}

/// Failure of a single tool call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    /// Raw input text was not valid JSON or failed the tool's input schema.
    #[error("invalid input for tool `{tool_name}`: {message}")]
    InvalidInput { tool_name: String, message: String },
    /// The model named a tool that is not registered.
    #[error("model tried to call unavailable tool `{tool_name}`; available tools: {available}")]
    NoSuchTool { tool_name: String, available: String },
    /// The tool's executor failed. `details` carries a structured error value when available.
    #[error("{message}")]
    Execution {
        message: String,
        details: Option<Value>,
    },
    /// A produced output could not be serialized.
    #[error("tool output serialization failed: {0}")]
    Serialization(String),
}

impl ToolError {
    /// Creates an execution error from a message.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            details: None,
        }
    }

    /// Creates an execution error carrying a structured error value.
    pub fn execution_with_details(message: impl Into<String>, details: Value) -> Self {
        Self::Execution {
            message: message.into(),
            details: Some(details),
        }
    }

    /// True for the failures detected before execution was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidInput { .. } | Self::NoSuchTool { .. })
    }
}

/// Error value carried by `StreamEvent::Error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// Model call or raw stream failure.
    #[error(transparent)]
    Model(ModelError),
    /// Error chunk reported by the provider inside an otherwise healthy stream.
    #[error("provider stream error: {0}")]
    Provider(Value),
    /// The pipeline detected an invalid event sequence.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A tool failure surfaced as a stream error.
    #[error(transparent)]
    Tool(ToolError),
}

/// Terminal run failure used to reject result handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum RunFailure {
    /// The model collaborator failed and the run could not continue.
    #[error("model failure: {message}")]
    Model { message: String },
    /// The pipeline detected a protocol or invariant error.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
    /// The run was cancelled before any step completed.
    #[error("run cancelled")]
    Cancelled,
}

impl From<&ModelError> for RunFailure {
    fn from(err: &ModelError) -> Self {
        match err {
            ModelError::Cancelled => RunFailure::Cancelled,
            ModelError::Protocol { message } => RunFailure::Protocol {
                message: message.clone(),
            },
            other => RunFailure::Model {
                message: other.to_string(),
            },
        }
    }
}

/// Rejection reason of a deferred result handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultError {
    /// The run finished without completing a single step.
    #[error("no output generated; the run finished before any step completed")]
    NoOutput,
    /// The run ended in a terminal failure.
    #[error(transparent)]
    Failed(RunFailure),
    /// The run task stopped before it resolved its results.
    #[error("run ended before results were resolved")]
    Aborted,
}

/// Top-level error type for the public API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    /// Invalid engine configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid user input to the builder API.
    #[error("validation error: {0}")]
    Validation(String),
    /// A deferred result was rejected.
    #[error(transparent)]
    Result(ResultError),
    /// The final text could not be turned into the requested output.
    #[error("no object generated: {0}")]
    NoObjectGenerated(String),
}

impl From<ResultError> for AgentError {
    fn from(value: ResultError) -> Self {
        AgentError::Result(value)
    }
}

impl From<RunFailure> for AgentError {
    fn from(value: RunFailure) -> Self {
        AgentError::Result(ResultError::Failed(value))
    }
}
