//! The replay bridge and the addon-aware HTTP exchange.
//!
//! Decrypted tunnel traffic is served by the same HTTP loop and router as
//! plain proxy traffic. Every intercepted request, plain or decrypted, goes
//! through [`exchange`]: flow hooks fire, then the request is written onto
//! the connection's upstream session. A session is one upstream HTTP/1.1
//! connection; keep-alive requests reuse it until it closes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::body::{self, buffer_limited, Buffered, OnEnd, ProxyBody};
use crate::connection::{ConnContext, ServerConn};
use crate::entry::{self, Shared};
use crate::error::{is_benign_hyper, ProxyError, Result};
use crate::flow::{self, Flow};
use crate::host_port::{canonical_addr, split_host_port};
use crate::relay::{self, log_error, origin_form};
use crate::upstream::Io;

/// One upstream HTTP/1.1 connection owned by a client connection.
pub struct UpstreamSession {
    address: String,
    sender: SendRequest<ProxyBody>,
    server: Arc<ServerConn>,
    pinned: bool,
}

impl UpstreamSession {
    /// Starts an HTTP/1.1 client over `io`. When the connection ends, the
    /// server connection is closed through `ctx`.
    pub(crate) async fn start<S: Io>(
        ctx: &Arc<ConnContext>,
        server: Arc<ServerConn>,
        address: String,
        io: S,
        pinned: bool,
    ) -> Result<Self> {
        let (sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake::<_, ProxyBody>(TokioIo::new(io))
            .await?;

        let driver_ctx = Arc::clone(ctx);
        let driver_server = Arc::clone(&server);
        tokio::spawn(async move {
            match conn.await {
                Ok(()) => debug!(server = %driver_server.address, "upstream session ended"),
                Err(e) if is_benign_hyper(&e) => {
                    debug!(server = %driver_server.address, "upstream session ended: {e}")
                }
                Err(e) => log_error("upstream session", &ProxyError::Http(e)),
            }
            driver_ctx.close_server_conn(&driver_server);
        });

        Ok(Self {
            address,
            sender,
            server,
            pinned,
        })
    }

    fn usable_for(&self, address: &str, tls: bool) -> bool {
        if self.server.is_closed() || self.sender.is_closed() {
            return false;
        }
        self.pinned || tls || self.address == address
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("address", &self.address)
            .field("server", &self.server.id)
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// Serves the decrypted side of an intercepted tunnel. `session` is the
/// upstream already established in eager mode.
pub(crate) fn serve<S: Io>(
    shared: Arc<Shared>,
    ctx: Arc<ConnContext>,
    stream: S,
    authority: String,
    session: Option<UpstreamSession>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        *ctx.session.lock().await = session;
        entry::serve_http(shared, ctx, stream, Some(Arc::from(authority))).await;
    })
}

/// Runs one intercepted request/response exchange with hooks.
pub(crate) async fn exchange(
    shared: &Arc<Shared>,
    ctx: &Arc<ConnContext>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let (parts, req_body) = req.into_parts();
    let limit = shared.options.stream_threshold();

    ctx.next_flow();
    let mut flow = Flow::new(Arc::clone(ctx), flow::Request::from_parts(&parts, None));
    if flow.request.wants_close() {
        ctx.set_close_after_response();
    }
    shared.addons.begin_flow(&flow);

    let streamed_request =
        match buffer_limited(body::incoming(req_body), content_length(&parts.headers), limit).await {
            Ok(Buffered::Complete(bytes)) => {
                flow.request.body = Some(bytes);
                None
            }
            Ok(Buffered::Streaming(stream)) => {
                flow.stream = true;
                Some(stream)
            }
            Err(e) => {
                log_error("read request body", &ProxyError::Http(e));
                return fail(flow, StatusCode::BAD_REQUEST);
            }
        };

    shared.addons.request(&mut flow);

    if let Some(response) = flow.response.clone() {
        debug!(flow = %flow.id, "request answered by addon");
        return respond_buffered(flow, response);
    }

    let upstream_req = upstream_request(&flow.request, streamed_request);
    let res = match send(shared, ctx, &flow.request, upstream_req).await {
        Ok(res) => res,
        Err(e) => {
            log_error("upstream request", &e);
            return fail(flow, StatusCode::BAD_GATEWAY);
        }
    };

    let (res_parts, res_body) = res.into_parts();
    let mut response = flow::Response::from_parts(&res_parts, None);
    if response.wants_close() {
        ctx.set_close_after_response();
    }

    let head_only = flow.request.method == Method::HEAD;
    let declared = if head_only {
        Some(0)
    } else {
        content_length(&res_parts.headers)
    };
    let streamed_response =
        match buffer_limited(body::incoming(res_body), declared, limit).await {
            Ok(Buffered::Complete(bytes)) => {
                response.body = Some(bytes);
                None
            }
            Ok(Buffered::Streaming(stream)) => {
                flow.stream = true;
                Some(stream)
            }
            Err(e) => {
                log_error("read response body", &ProxyError::Http(e));
                return fail(flow, StatusCode::BAD_GATEWAY);
            }
        };

    flow.response = Some(response);
    shared.addons.response(&mut flow);

    let Some(response) = flow.response.clone() else {
        return fail(flow, StatusCode::BAD_GATEWAY);
    };

    match streamed_response {
        Some(stream) if response.body.is_none() => {
            let res = response.into_hyper(None);
            let (parts, _) = res.into_parts();
            let body = OnEnd::new(stream, move || flow.finish());
            Response::from_parts(parts, body.boxed_unsync())
        }
        Some(stream) => {
            // A response hook replaced the body; finish reading the upstream
            // one so the session is not torn down under the buffered reply.
            tokio::spawn(discard(stream));
            respond_buffered(flow, response)
        }
        None => respond_buffered(flow, response),
    }
}

async fn discard(mut body: ProxyBody) {
    while let Some(frame) = body.frame().await {
        if let Err(e) = frame {
            debug!("discarding upstream body failed: {e}");
            return;
        }
    }
}

/// Relays a protocol upgrade (WebSocket) to a fresh upstream connection.
/// No flow hooks run; once both sides switch, bytes are copied raw.
pub(crate) async fn upgrade(shared: &Arc<Shared>, mut req: Request<Incoming>) -> Response<ProxyBody> {
    let request = flow::Request::from_head(&req);
    let address = canonical_addr(req.uri());
    let tls = req.uri().scheme_str() == Some("https");
    let server_name = tls.then(|| split_host_port(&address).0.to_string());

    let io = match shared
        .dialer
        .open(&address, &request, server_name.as_deref())
        .await
    {
        Ok(io) => io,
        Err(e) => {
            log_error("upgrade", &e);
            return body::response(StatusCode::BAD_GATEWAY, "");
        }
    };

    let client_upgrade = hyper::upgrade::on(&mut req);
    ensure_host(&mut req);
    req.headers_mut().remove("proxy-connection");
    *req.uri_mut() = origin_form(req.uri());

    match relay::send_upgradable(io, req.map(body::incoming), Some(client_upgrade)).await {
        Ok(res) => res,
        Err(e) => {
            log_error("upgrade", &e);
            body::response(StatusCode::BAD_GATEWAY, "")
        }
    }
}

/// Finishes `flow` with a bare error status.
fn fail(mut flow: Flow, status: StatusCode) -> Response<ProxyBody> {
    flow.response = Some(flow::Response::new(status));
    flow.finish();
    body::response(status, "")
}

/// Answers with a fully buffered response and finishes the flow.
fn respond_buffered(flow: Flow, mut response: flow::Response) -> Response<ProxyBody> {
    let keeps_framing = flow.request.method == Method::HEAD
        || response.status.is_informational()
        || response.status == StatusCode::NO_CONTENT
        || response.status == StatusCode::NOT_MODIFIED;

    if !keeps_framing {
        let len = response.body.as_ref().map_or(0, |b| b.len());
        response.headers.remove(TRANSFER_ENCODING);
        response.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    flow.finish();
    response.into_hyper(None)
}

/// Builds the upstream request from the (possibly rewritten) flow request.
fn upstream_request(request: &flow::Request, streamed: Option<ProxyBody>) -> Request<ProxyBody> {
    let body = match (&request.body, streamed) {
        (Some(bytes), _) => body::full(bytes.clone()),
        (None, Some(stream)) => stream,
        (None, None) => body::empty(),
    };

    let mut req = request.to_hyper(body);
    if let Some(bytes) = &request.body {
        let had_length = req.headers().contains_key(CONTENT_LENGTH)
            || req.headers().contains_key(TRANSFER_ENCODING);
        req.headers_mut().remove(TRANSFER_ENCODING);
        if had_length || !bytes.is_empty() {
            req.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        }
    }

    ensure_host(&mut req);
    req.headers_mut().remove("proxy-connection");
    *req.uri_mut() = origin_form(req.uri());
    req
}

fn ensure_host<B>(req: &mut Request<B>) {
    if req.headers().contains_key(HOST) {
        return;
    }
    let host = req
        .uri()
        .authority()
        .and_then(|a| HeaderValue::from_str(a.as_str()).ok());
    if let Some(host) = host {
        req.headers_mut().insert(HOST, host);
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Sends `req` on the connection's upstream session, dialing a new one when
/// there is none or the current one cannot serve this target.
async fn send(
    shared: &Arc<Shared>,
    ctx: &Arc<ConnContext>,
    request: &flow::Request,
    req: Request<ProxyBody>,
) -> Result<Response<Incoming>> {
    let address = canonical_addr(&request.url);
    let tls = ctx.client.tls();

    let pending = {
        let mut slot = ctx.session.lock().await;
        let reusable = slot
            .as_ref()
            .is_some_and(|session| session.usable_for(&address, tls));

        if !reusable {
            let session = open(shared, ctx, &address, request).await?;
            *slot = Some(session);
        }

        let stale = match slot.as_mut() {
            Some(session) => session.sender.ready().await.is_err(),
            None => true,
        };
        if stale {
            debug!(conn = %ctx.id, %address, "upstream session went away, redialing");
            *slot = Some(open(shared, ctx, &address, request).await?);
        }

        let session = slot.as_mut().ok_or(ProxyError::Cancelled)?;
        session.sender.ready().await?;
        session.sender.send_request(req)
    };

    tokio::select! {
        res = pending => Ok(res?),
        _ = ctx.client.closed() => Err(ProxyError::Cancelled),
    }
}

/// Dials `address` for `request` and starts a session on it.
async fn open(
    shared: &Arc<Shared>,
    ctx: &Arc<ConnContext>,
    address: &str,
    request: &flow::Request,
) -> Result<UpstreamSession> {
    let (server, io) = shared.dialer.connect(ctx, address, request).await?;

    if request.url.scheme_str() == Some("https") {
        let (host, _) = split_host_port(address);
        let tls = shared.dialer.handshake(ctx, &server, io, host).await?;
        UpstreamSession::start(ctx, server, address.to_string(), tls, false).await
    } else {
        UpstreamSession::start(ctx, server, address.to_string(), io, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_request_is_origin_form_with_host() {
        let mut request = flow::Request::new(
            Method::POST,
            "http://example.com:8080/submit?x=1".parse().unwrap(),
        );
        request
            .headers
            .insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        request.body = Some("rewritten".into());

        let req = upstream_request(&request, None);
        assert_eq!(req.uri(), "/submit?x=1");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert_eq!(req.headers()[CONTENT_LENGTH], "9");
        assert!(!req.headers().contains_key("proxy-connection"));
    }

    #[test]
    fn empty_get_gets_no_content_length() {
        let mut request = flow::Request::new(Method::GET, "http://example.com/".parse().unwrap());
        request.body = Some(Default::default());
        let req = upstream_request(&request, None);
        assert!(!req.headers().contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert_eq!(content_length(&headers), None);
    }
}
