use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::recorder::{StepRecorder, TranscriptSnapshot};
use crate::stream::StreamEvent;
use crate::wire::{SSE_DONE, WireChunk, WireEncoder, WireStreamOptions, sse_frame};

pub(crate) type SharedRecorder = Arc<Mutex<StepRecorder>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Passed to a consumer's finish callback once it reaches `finish` or `abort`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerFinish {
    pub transcript: TranscriptSnapshot,
    pub aborted: bool,
}

pub type ConsumerFinishCallback = Arc<dyn Fn(ConsumerFinish) + Send + Sync>;

#[derive(Default)]
struct MuxState {
    history: Vec<StreamEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
    closed: bool,
    /// No late subscribers can attach anymore; history is not kept.
    history_released: bool,
}

/// Fans canonical events out to independent consumer queues.
///
/// Late subscribers receive the history first, so every consumer sees the
/// full sequence regardless of when it attached. The history lives until
/// [`Multiplexer::release_history`] is called.
#[derive(Clone, Default)]
pub(crate) struct Multiplexer {
    inner: Arc<Mutex<MuxState>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: StreamEvent) {
        let mut state = lock(&self.inner);
        if state.closed {
            return;
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if !state.history_released {
            state.history.push(event);
        }
    }

    /// Drops the replay history and stops recording it. Existing subscribers
    /// keep receiving live events; later subscribers only see what follows.
    pub fn release_history(&self) {
        let mut state = lock(&self.inner);
        state.history_released = true;
        state.history = Vec::new();
    }

    /// Ends every queue after its buffered events.
    pub fn close(&self) {
        let mut state = lock(&self.inner);
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let mut state = lock(&self.inner);
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &state.history {
            let _ = tx.send(event.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        rx
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    #[cfg(test)]
    pub fn history_len(&self) -> usize {
        lock(&self.inner).history.len()
    }
}

struct Subscription {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    recorder: SharedRecorder,
    on_finish: Option<ConsumerFinishCallback>,
    done: bool,
}

impl Subscription {
    fn new(mux: &Multiplexer, recorder: SharedRecorder) -> Self {
        Self {
            rx: mux.subscribe(),
            recorder,
            on_finish: None,
            done: false,
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(event) => {
                if event.is_terminal() {
                    self.done = true;
                    self.fire(matches!(event, StreamEvent::Abort));
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }

    fn fire(&mut self, aborted: bool) {
        if let Some(on_finish) = self.on_finish.take() {
            let transcript = lock(&self.recorder).snapshot();
            on_finish(ConsumerFinish {
                transcript,
                aborted,
            });
        }
    }

    fn cancel(&mut self) {
        self.done = true;
        self.on_finish = None;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    fn transcript(&self) -> TranscriptSnapshot {
        lock(&self.recorder).snapshot()
    }
}

/// The full canonical event stream.
pub struct FullStream {
    sub: Subscription,
}

impl FullStream {
    pub(crate) fn new(mux: &Multiplexer, recorder: SharedRecorder) -> Self {
        Self {
            sub: Subscription::new(mux, recorder),
        }
    }

    /// Called once if this stream is read through `finish` or `abort`.
    pub fn on_finish(mut self, f: impl Fn(ConsumerFinish) + Send + Sync + 'static) -> Self {
        self.sub.on_finish = Some(Arc::new(f));
        self
    }

    /// Stops reading and releases buffered events. The finish callback will not fire.
    pub fn cancel(&mut self) {
        self.sub.cancel();
    }

    /// What has been recorded so far, including the step in progress.
    pub fn transcript(&self) -> TranscriptSnapshot {
        self.sub.transcript()
    }
}

impl Stream for FullStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().sub.poll_event(cx)
    }
}

/// Only the text deltas, in order.
pub struct TextStream {
    sub: Subscription,
}

impl TextStream {
    pub(crate) fn new(mux: &Multiplexer, recorder: SharedRecorder) -> Self {
        Self {
            sub: Subscription::new(mux, recorder),
        }
    }

    /// Called once when this stream reaches `finish` or `abort`.
    pub fn on_finish(mut self, f: impl Fn(ConsumerFinish) + Send + Sync + 'static) -> Self {
        self.sub.on_finish = Some(Arc::new(f));
        self
    }

    /// Stops this consumer only. The run and other consumers continue.
    pub fn cancel(&mut self) {
        self.sub.cancel();
    }

    /// What has been recorded so far, including the step in progress.
    pub fn transcript(&self) -> TranscriptSnapshot {
        self.sub.transcript()
    }
}

impl Stream for TextStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(this.sub.poll_event(cx)) {
                Some(StreamEvent::TextDelta { text, .. }) => return Poll::Ready(Some(text)),
                Some(_) => continue,
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Events encoded as UI message stream chunks.
pub struct WireStream {
    sub: Subscription,
    encoder: WireEncoder,
    pending: VecDeque<WireChunk>,
}

impl WireStream {
    pub(crate) fn new(
        mux: &Multiplexer,
        recorder: SharedRecorder,
        mut options: WireStreamOptions,
    ) -> Self {
        let mut sub = Subscription::new(mux, recorder);
        sub.on_finish = options.on_finish.take();
        Self {
            sub,
            encoder: WireEncoder::new(options),
            pending: VecDeque::new(),
        }
    }

    /// Stops reading and drops chunks not yet yielded.
    pub fn cancel(&mut self) {
        self.pending.clear();
        self.sub.cancel();
    }

    pub fn transcript(&self) -> TranscriptSnapshot {
        self.sub.transcript()
    }

    /// SSE frames, ending with `data: [DONE]` once the chunks run out.
    pub fn into_sse(self) -> SseBody {
        SseBody {
            chunks: self,
            done_sent: false,
        }
    }
}

impl Stream for WireStream {
    type Item = WireChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.pending.pop_front() {
                return Poll::Ready(Some(chunk));
            }
            match ready!(this.sub.poll_event(cx)) {
                Some(event) => this.pending.extend(this.encoder.encode(&event)),
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Byte body for an SSE response.
pub struct SseBody {
    chunks: WireStream,
    done_sent: bool,
}

impl SseBody {
    /// Ends the body without a `[DONE]` frame.
    pub fn cancel(&mut self) {
        self.done_sent = true;
        self.chunks.cancel();
    }
}

impl Stream for SseBody {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done_sent {
            return Poll::Ready(None);
        }
        match ready!(Pin::new(&mut this.chunks).poll_next(cx)) {
            Some(chunk) => Poll::Ready(Some(sse_frame(&chunk))),
            None => {
                this.done_sent = true;
                Poll::Ready(Some(Bytes::from_static(SSE_DONE)))
            }
        }
    }
}

/// Plain UTF-8 text body.
pub struct TextBody {
    text: TextStream,
}

impl TextBody {
    pub(crate) fn new(text: TextStream) -> Self {
        Self { text }
    }
}

impl Stream for TextBody {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.text)
            .poll_next(cx)
            .map(|text| text.map(Bytes::from))
    }
}
