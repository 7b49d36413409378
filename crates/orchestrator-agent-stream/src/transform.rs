use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::stream::StreamEvent;
use crate::tool::ToolSet;

/// Read-only context handed to every transform stage.
#[derive(Clone, Copy, Debug)]
pub struct TransformContext<'a> {
    pub tools: &'a ToolSet,
}

/// What a stage does with one event.
#[derive(Debug, PartialEq)]
pub enum TransformOutput {
    /// Forward these events downstream, in order.
    Emit(Vec<StreamEvent>),
    /// Forward these events downstream, waiting `interval` between them.
    Paced {
        events: Vec<StreamEvent>,
        interval: Duration,
    },
    /// Forward these events, then stop raw production. Buffered stages are still flushed.
    Stop(Vec<StreamEvent>),
}

impl TransformOutput {
    pub fn pass(event: StreamEvent) -> Self {
        Self::Emit(vec![event])
    }

    pub fn drop_event() -> Self {
        Self::Emit(Vec::new())
    }

    fn into_parts(self) -> (Vec<StreamEvent>, Option<Duration>, bool) {
        match self {
            Self::Emit(events) => (events, None, false),
            Self::Paced { events, interval } => (events, Some(interval), false),
            Self::Stop(events) => (events, None, true),
        }
    }
}

/// A stage of the transform pipeline.
///
/// Stages may buffer; whatever they hold when the stream completes normally
/// is drained through `flush`. On abort or a terminal error buffers are discarded.
#[async_trait::async_trait]
pub trait StreamTransform: Send {
    async fn transform(
        &mut self,
        event: StreamEvent,
        ctx: &TransformContext<'_>,
    ) -> TransformOutput;

    async fn flush(&mut self, _ctx: &TransformContext<'_>) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// Wraps a synchronous function as a stage.
pub struct MapTransform<F> {
    f: F,
}

pub fn map_transform<F>(f: F) -> MapTransform<F>
where
    F: FnMut(StreamEvent, &TransformContext<'_>) -> TransformOutput + Send,
{
    MapTransform { f }
}

#[async_trait::async_trait]
impl<F> StreamTransform for MapTransform<F>
where
    F: FnMut(StreamEvent, &TransformContext<'_>) -> TransformOutput + Send,
{
    async fn transform(
        &mut self,
        event: StreamEvent,
        ctx: &TransformContext<'_>,
    ) -> TransformOutput {
        (self.f)(event, ctx)
    }
}

/// Receives pipeline output.
pub type EventSink<'a> = dyn FnMut(StreamEvent) + Send + 'a;

/// How production continues after an event went through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// A stage requested a stop.
    Stopped,
    /// Cancellation fired while paced output was pending; the rest was dropped.
    Aborted,
}

impl Flow {
    fn merge(self, other: Flow) -> Flow {
        match (self, other) {
            (Flow::Aborted, _) | (_, Flow::Aborted) => Flow::Aborted,
            (Flow::Stopped, _) | (_, Flow::Stopped) => Flow::Stopped,
            _ => Flow::Continue,
        }
    }
}

/// Ordered stages applied to every canonical event before it is recorded and broadcast.
pub struct TransformPipeline {
    stages: Vec<Box<dyn StreamTransform>>,
    tools: Arc<ToolSet>,
    cancellation: CancellationToken,
}

impl TransformPipeline {
    pub fn new(stages: Vec<Box<dyn StreamTransform>>, tools: Arc<ToolSet>) -> Self {
        Self {
            stages,
            tools,
            cancellation: CancellationToken::new(),
        }
    }

    /// Paced output stops as soon as `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs one event through every stage.
    pub async fn process(&mut self, event: StreamEvent, sink: &mut EventSink<'_>) -> Flow {
        let ctx = TransformContext { tools: &self.tools };
        feed(&mut self.stages, &ctx, &self.cancellation, event, sink).await
    }

    /// Drains buffered events stage by stage; each stage's leftovers still pass
    /// through the stages after it.
    pub async fn flush(&mut self, sink: &mut EventSink<'_>) {
        let ctx = TransformContext { tools: &self.tools };
        for index in 0..self.stages.len() {
            let (head, rest) = self.stages.split_at_mut(index + 1);
            let leftovers = head[index].flush(&ctx).await;
            for event in leftovers {
                if feed(rest, &ctx, &self.cancellation, event, sink).await == Flow::Aborted {
                    return;
                }
            }
        }
    }
}

fn feed<'a>(
    stages: &'a mut [Box<dyn StreamTransform>],
    ctx: &'a TransformContext<'a>,
    cancellation: &'a CancellationToken,
    event: StreamEvent,
    sink: &'a mut EventSink<'_>,
) -> BoxFuture<'a, Flow> {
    Box::pin(async move {
        let Some((stage, rest)) = stages.split_first_mut() else {
            sink(event);
            return Flow::Continue;
        };
        let (events, interval, stop) = stage.transform(event, ctx).await.into_parts();
        let mut flow = if stop { Flow::Stopped } else { Flow::Continue };
        for (index, event) in events.into_iter().enumerate() {
            if index > 0
                && let Some(interval) = interval
            {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Flow::Aborted,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            flow = flow.merge(feed(rest, ctx, cancellation, event, sink).await);
            if flow == Flow::Aborted {
                return flow;
            }
        }
        flow
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            id: "1".into(),
            text: text.into(),
            provider_metadata: None,
        }
    }

    struct Buffering {
        held: Vec<StreamEvent>,
    }

    #[async_trait::async_trait]
    impl StreamTransform for Buffering {
        async fn transform(
            &mut self,
            event: StreamEvent,
            _ctx: &TransformContext<'_>,
        ) -> TransformOutput {
            self.held.push(event);
            TransformOutput::drop_event()
        }

        async fn flush(&mut self, _ctx: &TransformContext<'_>) -> Vec<StreamEvent> {
            std::mem::take(&mut self.held)
        }
    }

    fn upper() -> MapTransform<impl FnMut(StreamEvent, &TransformContext<'_>) -> TransformOutput + Send>
    {
        map_transform(|event, _ctx: &TransformContext<'_>| match event {
            StreamEvent::TextDelta {
                id,
                text,
                provider_metadata,
            } => TransformOutput::pass(StreamEvent::TextDelta {
                id,
                text: text.to_uppercase(),
                provider_metadata,
            }),
            other => TransformOutput::pass(other),
        })
    }

    #[tokio::test]
    async fn stages_apply_in_order() {
        let mut pipeline = TransformPipeline::new(
            vec![
                Box::new(upper()),
                Box::new(map_transform(|event, _ctx: &TransformContext<'_>| {
                    TransformOutput::Emit(vec![event.clone(), event])
                })),
            ],
            Arc::new(ToolSet::new()),
        );
        let mut out = Vec::new();
        let flow = pipeline.process(delta("a"), &mut |event| out.push(event)).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(out, vec![delta("A"), delta("A")]);
    }

    #[tokio::test]
    async fn flush_passes_leftovers_through_later_stages() {
        let mut pipeline = TransformPipeline::new(
            vec![Box::new(Buffering { held: Vec::new() }), Box::new(upper())],
            Arc::new(ToolSet::new()),
        );
        let mut out = Vec::new();
        pipeline.process(delta("x"), &mut |event| out.push(event)).await;
        assert!(out.is_empty());
        pipeline.flush(&mut |event| out.push(event)).await;
        assert_eq!(out, vec![delta("X")]);
    }

    #[tokio::test]
    async fn stop_request_is_reported() {
        let mut pipeline = TransformPipeline::new(
            vec![Box::new(map_transform(|event, _ctx: &TransformContext<'_>| {
                TransformOutput::Stop(vec![event])
            }))],
            Arc::new(ToolSet::new()),
        );
        let mut out = Vec::new();
        assert_eq!(
            pipeline.process(delta("x"), &mut |event| out.push(event)).await,
            Flow::Stopped
        );
        assert_eq!(out.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_paced_output_short() {
        let token = CancellationToken::new();
        let mut pipeline = TransformPipeline::new(
            vec![Box::new(map_transform(|event, _ctx: &TransformContext<'_>| {
                TransformOutput::Paced {
                    events: vec![event.clone(), event.clone(), event],
                    interval: Duration::from_secs(1),
                }
            }))],
            Arc::new(ToolSet::new()),
        )
        .with_cancellation(token.clone());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let mut out = Vec::new();
        let flow = pipeline.process(delta("x"), &mut |event| out.push(event)).await;
        assert_eq!(flow, Flow::Aborted);
        assert_eq!(out, vec![delta("x")]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
