//! Body wrappers that copy what passes through them.
//!
//! The middleware never holds a body back from its consumer. Frames are
//! forwarded as soon as the inner body yields them, and a bounded copy is
//! kept on the side for the event.

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

/// Bounded copy of a body as it streams past.
///
/// The copy is only usable once the body reached its end without error and
/// without exceeding the limit. Anything else yields no body at all: a
/// prefix of a JSON document could not be redacted.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    bytes: BytesMut,
    limit: usize,
    overflowed: bool,
    failed: bool,
    complete: bool,
}

impl CaptureBuffer {
    /// An empty buffer keeping at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Append a data frame.
    pub fn push(&mut self, data: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.bytes.len() + data.len() > self.limit {
            self.overflowed = true;
            self.bytes = BytesMut::new();
            return;
        }
        self.bytes.extend_from_slice(data);
    }

    /// The body reached its end.
    pub fn finish(&mut self) {
        self.complete = true;
    }

    /// The body failed mid-stream.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Whether more than `limit` bytes went past.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The captured body, if it was seen whole.
    pub fn captured(&self) -> Option<Bytes> {
        let whole = self.complete && !self.overflowed && !self.failed;
        whole.then(|| Bytes::copy_from_slice(&self.bytes))
    }
}

fn lock(buffer: &Mutex<CaptureBuffer>) -> std::sync::MutexGuard<'_, CaptureBuffer> {
    buffer.lock().unwrap_or_else(|p| p.into_inner())
}

/// Record a polled frame in `buffer`.
fn observe<E>(buffer: &mut CaptureBuffer, frame: &Option<Result<Frame<Bytes>, E>>, at_end: bool) {
    match frame {
        Some(Ok(frame)) => {
            if let Some(data) = frame.data_ref() {
                buffer.push(data);
            }
            if at_end {
                buffer.finish();
            }
        }
        Some(Err(_)) => buffer.fail(),
        None => buffer.finish(),
    }
}

pin_project! {
    /// Forwards a body unchanged while copying it into a shared
    /// [`CaptureBuffer`].
    ///
    /// Used for request bodies: the handler drives the stream and the
    /// middleware reads the buffer once the response is done.
    pub struct CaptureBody<B> {
        #[pin]
        inner: B,
        buffer: Arc<Mutex<CaptureBuffer>>,
    }
}

impl<B> CaptureBody<B> {
    /// Wrap `inner`, copying into `buffer`.
    pub fn new(inner: B, buffer: Arc<Mutex<CaptureBuffer>>) -> Self {
        Self { inner, buffer }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));
        observe(&mut lock(this.buffer), &frame, this.inner.is_end_stream());
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

type OnComplete = Box<dyn FnOnce(CaptureBuffer) + Send>;

/// Hands the buffer to its callback exactly once, at the latest on drop.
struct Completion {
    buffer: CaptureBuffer,
    on_complete: Option<OnComplete>,
}

impl Completion {
    fn fire(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(std::mem::take(&mut self.buffer));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

pin_project! {
    /// Forwards a body unchanged, copying it into a private
    /// [`CaptureBuffer`], and calls back when the body ends, fails or is
    /// dropped unfinished.
    ///
    /// Used for response bodies, whose end is only known once the caller
    /// has read them.
    pub struct RecordingBody<B> {
        #[pin]
        inner: B,
        completion: Completion,
    }
}

impl<B> RecordingBody<B> {
    /// Wrap `inner`; `on_complete` receives the buffer.
    pub fn new<F>(inner: B, limit: usize, on_complete: F) -> Self
    where
        F: FnOnce(CaptureBuffer) + Send + 'static,
    {
        Self {
            inner,
            completion: Completion {
                buffer: CaptureBuffer::new(limit),
                on_complete: Some(Box::new(on_complete)),
            },
        }
    }
}

impl<B> Body for RecordingBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));
        let completion = this.completion;

        if completion.on_complete.is_some() {
            observe(&mut completion.buffer, &frame, this.inner.is_end_stream());
            let buffer = &completion.buffer;
            if buffer.complete || buffer.failed {
                completion.fire();
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
