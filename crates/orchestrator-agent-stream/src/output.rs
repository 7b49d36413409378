use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::Stream;
use serde_json::Value;

use crate::broadcast::FullStream;
use crate::errors::AgentError;
use crate::stream::StreamEvent;
use crate::tool::InputSchema;

/// Shape the final text of a run is parsed into.
#[derive(Clone)]
pub enum Output {
    /// Plain text, passed through.
    Text,
    /// A JSON value checked against a schema. The schema is sent to the model
    /// as the response format.
    Object(Arc<dyn InputSchema>),
}

impl Output {
    pub fn text() -> Self {
        Self::Text
    }

    pub fn object(schema: impl InputSchema + 'static) -> Self {
        Self::Object(Arc::new(schema))
    }

    /// JSON schema requested from the model; `None` for plain text.
    pub fn response_format(&self) -> Option<Value> {
        match self {
            Self::Text => None,
            Self::Object(schema) => Some(schema.json_schema()),
        }
    }

    /// Best-effort value for text that may still be growing. Partial objects
    /// are not validated.
    pub fn parse_partial(&self, text: &str) -> Option<Value> {
        match self {
            Self::Text => Some(Value::String(text.to_string())),
            Self::Object(_) => parse_partial_json(text),
        }
    }

    /// Parses and validates the complete text of the final step.
    pub fn parse_complete(&self, text: &str) -> Result<Value, AgentError> {
        match self {
            Self::Text => Ok(Value::String(text.to_string())),
            Self::Object(schema) => {
                let value: Value = serde_json::from_str(text).map_err(|err| {
                    AgentError::NoObjectGenerated(format!("could not parse the response: {err}"))
                })?;
                schema.validate(value).map_err(|message| {
                    AgentError::NoObjectGenerated(format!(
                        "response did not match schema: {message}"
                    ))
                })
            }
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Object(schema) => f.debug_tuple("Object").field(&schema.json_schema()).finish(),
        }
    }
}

/// Parses JSON that may be cut off anywhere.
///
/// Open strings and containers are closed; when the tail still does not
/// parse (a half-written literal, key, or number) characters are dropped from
/// the end until it does.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    let mut end = text.len();
    loop {
        if let Some(value) = close_json(&text[..end]).and_then(|closed| serde_json::from_str(&closed).ok()) {
            return Some(value);
        }
        end = text[..end].char_indices().next_back()?.0;
        if end == 0 {
            return None;
        }
    }
}

fn close_json(prefix: &str) -> Option<String> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in prefix.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop()?;
            }
            _ => {}
        }
    }
    if escaped {
        return None;
    }

    let mut closed = if in_string {
        format!("{prefix}\"")
    } else {
        let trimmed = prefix.trim_end();
        trimmed.strip_suffix(',').unwrap_or(trimmed).to_string()
    };
    closed.extend(closers.iter().rev());
    Some(closed)
}

/// Partial output values derived from the first text part of the run,
/// yielded whenever the parsed value changes.
pub struct PartialOutputStream {
    events: FullStream,
    output: Output,
    text_id: Option<String>,
    text: String,
    last: Option<Value>,
}

impl PartialOutputStream {
    pub(crate) fn new(events: FullStream, output: Output) -> Self {
        Self {
            events,
            output,
            text_id: None,
            text: String::new(),
            last: None,
        }
    }

    pub fn cancel(&mut self) {
        self.events.cancel();
    }
}

impl Stream for PartialOutputStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(event) = ready!(Pin::new(&mut this.events).poll_next(cx)) else {
                return Poll::Ready(None);
            };
            let StreamEvent::TextDelta { id, text, .. } = event else {
                continue;
            };
            if *this.text_id.get_or_insert_with(|| id.clone()) != id {
                continue;
            }
            this.text.push_str(&text);
            if let Some(partial) = this.output.parse_partial(&this.text)
                && this.last.as_ref() != Some(&partial)
            {
                this.last = Some(partial.clone());
                return Poll::Ready(Some(partial));
            }
        }
    }
}
