//! Flows: one logical request/response exchange.
//!
//! A flow is created when a request head is parsed (or a CONNECT tunnel is
//! opened), carries the request and eventually the response, and finishes
//! exactly once. Finishing fires `end_flow` and then wakes everything
//! waiting on [`Flow::done`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::http::request::Parts as RequestParts;
use hyper::http::response::Parts as ResponseParts;
use hyper::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

use crate::body::{self, ProxyBody};
use crate::connection::ConnContext;

/// A request as seen by addons.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Absolute URL of the target.
    pub url: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// The buffered body, or `None` when it streams.
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: Uri) -> Self {
        Self {
            method,
            url,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub(crate) fn from_parts(parts: &RequestParts, body: Option<Bytes>) -> Self {
        Self {
            method: parts.method.clone(),
            url: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            body,
        }
    }

    /// Captures the head of a hyper request.
    pub(crate) fn from_head<B>(req: &hyper::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            url: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            body: None,
        }
    }

    /// The target host, from the URL or else the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.url
            .authority()
            .map(|a| a.as_str())
            .or_else(|| self.headers.get(HOST).and_then(|h| h.to_str().ok()))
    }

    /// Whether the request asks for the connection to close afterwards.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.headers)
    }

    /// Rebuilds a hyper request around `body`.
    pub(crate) fn to_hyper(&self, body: ProxyBody) -> hyper::Request<ProxyBody> {
        let mut req = hyper::Request::new(body);
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.url.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }
}

/// A response as seen by addons.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The buffered body, or `None` when it streams.
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// A response with a buffered body.
    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Some(body.into()),
        }
    }

    pub(crate) fn from_parts(parts: &ResponseParts, body: Option<Bytes>) -> Self {
        Self {
            status: parts.status,
            headers: parts.headers.clone(),
            body,
        }
    }

    /// Whether the response asks for the connection to close afterwards.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.headers)
    }

    /// Converts into a hyper response. A buffered body replaces `streamed`.
    pub(crate) fn into_hyper(self, streamed: Option<ProxyBody>) -> hyper::Response<ProxyBody> {
        let body = match (self.body, streamed) {
            (Some(bytes), _) => body::full(bytes),
            (None, Some(stream)) => stream,
            (None, None) => body::empty(),
        };
        let mut res = hyper::Response::new(body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v: &HeaderValue| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// One request/response exchange on a connection.
pub struct Flow {
    pub id: Uuid,
    pub request: Request,
    /// Set by the proxy once the upstream answers, or by a `request` hook
    /// to answer the client directly.
    pub response: Option<Response>,
    /// Whether a body of this flow streams instead of being buffered.
    pub stream: bool,
    conn: Arc<ConnContext>,
    started: Instant,
    done: CancellationToken,
    finished: AtomicBool,
}

impl Flow {
    pub fn new(conn: Arc<ConnContext>, request: Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            stream: false,
            conn,
            started: Instant::now(),
            done: CancellationToken::new(),
            finished: AtomicBool::new(false),
        }
    }

    /// The connection this flow belongs to.
    pub fn conn(&self) -> &Arc<ConnContext> {
        &self.conn
    }

    /// Time since the flow started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Resolves once the flow has finished. Waiters registered after that
    /// resolve immediately.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.done.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Fires `end_flow` and signals completion. Later calls do nothing.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.addons().end_flow(self);
        self.done.cancel();
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("status", &self.response.as_ref().map(|r| r.status))
            .field("stream", &self.stream)
            .field("done", &self.is_done())
            .finish()
    }
}
