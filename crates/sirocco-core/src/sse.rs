//! Server-Sent Events: wire framing, a pull mode driven by any event
//! stream, and a push mode with an emitter handle and a cleanup callback
//! that runs exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::http::{RequestContext, Response};

/// The canonical keep-alive comment.
pub const PING: &str = ": ping\n\n";

/// One event on the wire: up to four fields, blank-line terminated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    /// Client reconnection delay in milliseconds.
    pub retry: Option<u64>,
    pub data: String,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into(), ..Default::default() }
    }

    /// JSON-serialize onto a single `data:` line.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        let data = serde_json::to_string(value)
            .map_err(|e| Error::Other(format!("unserializable SSE payload: {e}")))?;
        Ok(Self::new(data))
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn retry(mut self, ms: u64) -> Self {
        self.retry = Some(ms);
        self
    }

    /// Wire framing; multi-line data repeats the `data:` field per line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Frame a comment line.
pub fn comment(text: &str) -> String {
    format!(": {text}\n\n")
}

/// `Last-Event-ID` sent by a reconnecting client, for skip/replay logic.
pub fn last_event_id(ctx: &RequestContext) -> Option<&str> {
    ctx.header("last-event-id")
}

fn apply_headers(res: Response) -> Response {
    res.header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
}

/// Pull mode: the handler supplies a lazy sequence of events; the writer
/// polls it only as the socket drains, so a slow client suspends the
/// generator.
pub fn response<S>(events: S) -> Response
where
    S: Stream<Item = SseEvent> + Send + 'static,
{
    use futures_util::StreamExt;
    let bytes = events.map(|ev| Ok(Bytes::from(ev.encode())));
    apply_headers(Response::stream(bytes))
}

/// Push mode: the handler receives an emitter and may return a cleanup
/// callback. The cleanup runs exactly once, whether the stream completes,
/// the client disconnects early, or the handler errors out.
pub fn push_response<F>(f: F) -> Response
where
    F: FnOnce(SseEmitter) -> Option<Cleanup>,
{
    let (emitter, mut stream) = channel();
    stream.cleanup = f(emitter);
    apply_headers(Response::stream(stream))
}

pub type Cleanup = Box<dyn FnOnce() + Send>;

enum Frame {
    Event(Box<SseEvent>),
    Comment(String),
}

struct Shared {
    closed: AtomicBool,
    warned: AtomicBool,
}

/// Emit handle for push mode. Clone freely; emits after the stream closed
/// are silently dropped (one warning per stream).
#[derive(Clone)]
pub struct SseEmitter {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
}

impl SseEmitter {
    pub fn send(&self, event: SseEvent) {
        self.dispatch(Frame::Event(Box::new(event)));
    }

    pub fn comment(&self, text: &str) {
        self.dispatch(Frame::Comment(text.to_string()));
    }

    pub fn ping(&self) {
        self.comment("ping");
    }

    /// True until the client disconnects or the stream finishes.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    fn dispatch(&self, frame: Frame) {
        if self.shared.closed.load(Ordering::Acquire) || self.tx.send(frame).is_err() {
            if !self.shared.warned.swap(true, Ordering::AcqRel) {
                tracing::warn!("SSE emit after stream cleanup; event dropped");
            }
        }
    }
}

/// The lazy byte sequence backing a push-mode response.
pub struct SseStream {
    rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    cleanup: Option<Cleanup>,
}

fn channel() -> (SseEmitter, SseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        warned: AtomicBool::new(false),
    });
    (
        SseEmitter { tx, shared: shared.clone() },
        SseStream { rx, shared, cleanup: None },
    )
}

impl SseStream {
    fn finish(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Stream for SseStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Event(ev))) => {
                Poll::Ready(Some(Ok(Bytes::from(ev.encode()))))
            }
            Poll::Ready(Some(Frame::Comment(text))) => {
                Poll::Ready(Some(Ok(Bytes::from(comment(&text)))))
            }
            Poll::Ready(None) => {
                // Every emitter dropped: normal completion.
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        // Early client disconnect lands here: the connection drops the body
        // stream mid-flight.
        self.finish();
    }
}
