use std::time::Duration;

use serde_json::Value;

use crate::stream::StreamEvent;
use crate::transform::{StreamTransform, TransformContext, TransformOutput};

/// Unit that smoothed deltas are cut into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Chunking {
    /// A run of non-whitespace plus the whitespace after it.
    #[default]
    Word,
    /// Text up to and including a run of newlines.
    Line,
}

impl Chunking {
    fn chunk_end(self, buffer: &str) -> Option<usize> {
        match self {
            Self::Word => {
                let start = buffer.char_indices().find(|(_, c)| !c.is_whitespace())?.0;
                let word = &buffer[start..];
                let gap = word.char_indices().find(|(_, c)| c.is_whitespace())?.0;
                let tail = &word[gap..];
                let gap_len = tail
                    .char_indices()
                    .find(|(_, c)| !c.is_whitespace())
                    .map_or(tail.len(), |(i, _)| i);
                Some(start + gap + gap_len)
            }
            Self::Line => {
                let newline = buffer.find('\n')?;
                let run = buffer[newline..]
                    .bytes()
                    .take_while(|b| *b == b'\n')
                    .count();
                Some(newline + run)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeltaKind {
    Text,
    Reasoning,
}

struct Pending {
    kind: DeltaKind,
    id: String,
    provider_metadata: Option<Value>,
}

/// Re-chunks text and reasoning deltas into words or lines, optionally
/// spacing the chunks out in time.
pub struct SmoothStream {
    chunking: Chunking,
    delay: Option<Duration>,
    buffer: String,
    pending: Option<Pending>,
}

impl Default for SmoothStream {
    fn default() -> Self {
        Self::new()
    }
}

impl SmoothStream {
    /// Word chunking with a 10 ms delay.
    pub fn new() -> Self {
        Self {
            chunking: Chunking::Word,
            delay: Some(Duration::from_millis(10)),
            buffer: String::new(),
            pending: None,
        }
    }

    pub fn chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    /// `None` emits chunks back to back.
    pub fn delay(mut self, delay: Option<Duration>) -> Self {
        self.delay = delay;
        self
    }

    fn delta_event(&self, pending: &Pending, text: String) -> StreamEvent {
        match pending.kind {
            DeltaKind::Text => StreamEvent::TextDelta {
                id: pending.id.clone(),
                text,
                provider_metadata: pending.provider_metadata.clone(),
            },
            DeltaKind::Reasoning => StreamEvent::ReasoningDelta {
                id: pending.id.clone(),
                text,
                provider_metadata: pending.provider_metadata.clone(),
            },
        }
    }

    fn drain_buffer(&mut self) -> Option<StreamEvent> {
        let pending = self.pending.take()?;
        if self.buffer.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        Some(self.delta_event(&pending, text))
    }

    fn output(&self, events: Vec<StreamEvent>) -> TransformOutput {
        match self.delay {
            Some(interval) if events.len() > 1 => TransformOutput::Paced { events, interval },
            _ => TransformOutput::Emit(events),
        }
    }
}

#[async_trait::async_trait]
impl StreamTransform for SmoothStream {
    async fn transform(
        &mut self,
        event: StreamEvent,
        _ctx: &TransformContext<'_>,
    ) -> TransformOutput {
        let (kind, id, text, provider_metadata) = match event {
            StreamEvent::TextDelta {
                id,
                text,
                provider_metadata,
            } => (DeltaKind::Text, id, text, provider_metadata),
            StreamEvent::ReasoningDelta {
                id,
                text,
                provider_metadata,
            } => (DeltaKind::Reasoning, id, text, provider_metadata),
            other => {
                let mut events: Vec<StreamEvent> = self.drain_buffer().into_iter().collect();
                events.push(other);
                return TransformOutput::Emit(events);
            }
        };

        let mut events = Vec::new();
        let switched = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.kind != kind || pending.id != id);
        if switched {
            events.extend(self.drain_buffer());
        }

        self.buffer.push_str(&text);
        let pending = Pending {
            kind,
            id,
            provider_metadata,
        };
        while let Some(end) = self.chunking.chunk_end(&self.buffer) {
            let rest = self.buffer.split_off(end);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            events.push(self.delta_event(&pending, chunk));
        }
        self.pending = Some(pending);
        self.output(events)
    }

    async fn flush(&mut self, _ctx: &TransformContext<'_>) -> Vec<StreamEvent> {
        self.drain_buffer().into_iter().collect()
    }
}
