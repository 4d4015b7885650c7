//! Body helpers: the proxy's boxed body type, size-limited buffering, and
//! wrappers for replaying already-read bytes and observing end of stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::StatusCode;

/// Body type used on both sides of the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body holding `chunk` in full.
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Boxes an inbound hyper body.
pub fn incoming(body: Incoming) -> ProxyBody {
    body.boxed_unsync()
}

/// A response with `status` and a fixed body.
pub fn response(status: StatusCode, text: impl Into<Bytes>) -> hyper::Response<ProxyBody> {
    let mut res = hyper::Response::new(full(text));
    *res.status_mut() = status;
    res
}

/// Outcome of [`buffer_limited`].
pub enum Buffered {
    /// The whole body, at most the limit in size.
    Complete(Bytes),
    /// The body exceeded the limit; it continues from the first byte.
    Streaming(ProxyBody),
}

impl std::fmt::Debug for Buffered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Buffered::Complete(bytes) => f.debug_tuple("Complete").field(&bytes.len()).finish(),
            Buffered::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Reads `body` into memory unless it is larger than `limit` bytes.
///
/// A declared `content_length` above the limit streams without reading. A
/// body of unknown size is read until it ends or crosses the limit; in the
/// latter case the bytes read so far are replayed ahead of the rest.
pub async fn buffer_limited(
    mut body: ProxyBody,
    content_length: Option<u64>,
    limit: u64,
) -> Result<Buffered, hyper::Error> {
    if content_length.is_some_and(|len| len > limit) {
        return Ok(Buffered::Streaming(body));
    }

    let mut collected: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        let Ok(data) = frame.into_data() else {
            // Trailers are not carried through buffered bodies.
            continue;
        };
        collected.extend_from_slice(&data);
        if collected.len() as u64 > limit {
            return Ok(Buffered::Streaming(
                Prefixed::new(Bytes::from(collected), body).boxed_unsync(),
            ));
        }
    }

    Ok(Buffered::Complete(Bytes::from(collected)))
}

/// Yields `prefix` before the frames of `inner`.
pub struct Prefixed {
    prefix: Option<Bytes>,
    inner: ProxyBody,
}

impl Prefixed {
    pub fn new(prefix: Bytes, inner: ProxyBody) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl Body for Prefixed {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(prefix) = self.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let extra = self.prefix.as_ref().map_or(0, |p| p.len() as u64);
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + extra);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + extra);
        }
        hint
    }
}

/// Runs a callback once, when the wrapped body ends, fails, or is dropped.
pub struct OnEnd {
    inner: ProxyBody,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

impl OnEnd {
    pub fn new(inner: ProxyBody, on_end: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_end: Some(Box::new(on_end)),
        }
    }

    fn fire(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end();
        }
    }
}

impl Body for OnEnd {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.fire();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for OnEnd {
    fn drop(&mut self) {
        self.fire();
    }
}
