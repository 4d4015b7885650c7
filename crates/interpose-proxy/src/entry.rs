//! Entry router: the accept loop, the per-connection HTTP loop and the
//! classification of every inbound request.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::addon::Addons;
use crate::body::{self, ProxyBody};
use crate::bridge;
use crate::ca::CertificateAuthority;
use crate::connection::ConnContext;
use crate::error::{is_benign_hyper, ProxyError, Result};
use crate::flow;
use crate::intercept;
use crate::options::Options;
use crate::relay;
use crate::upstream::{Dialer, Io, UpstreamProxyFn};

/// Body of the reply to requests addressed to the proxy itself.
pub const DIRECT_ACCESS_MESSAGE: &str =
    "This is a proxy server. Does not respond to non-proxy requests.";

/// Decides whether a request (or CONNECT tunnel) is intercepted.
pub type InterceptFn = Arc<dyn Fn(&flow::Request) -> bool + Send + Sync>;

/// State shared by every connection of a running proxy.
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) addons: Addons,
    pub(crate) ca: Arc<dyn CertificateAuthority>,
    pub(crate) dialer: Dialer,
    pub(crate) should_intercept: Option<InterceptFn>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) live: Mutex<HashMap<Uuid, Arc<ConnContext>>>,
    pub(crate) tracker: TaskTracker,
}

impl Shared {
    pub(crate) fn new(
        options: Options,
        addons: Addons,
        ca: Arc<dyn CertificateAuthority>,
        should_intercept: Option<InterceptFn>,
        upstream_proxy: Option<UpstreamProxyFn>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let dialer = Dialer::new(&options, upstream_proxy)?;
        Ok(Self {
            options,
            addons,
            ca,
            dialer,
            should_intercept,
            shutdown,
            live: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
        })
    }

    /// Everything is intercepted unless a predicate says otherwise.
    pub(crate) fn should_intercept(&self, request: &flow::Request) -> bool {
        self.should_intercept
            .as_ref()
            .map_or(true, |predicate| predicate(request))
    }
}

/// Accepts connections until shutdown is requested. Each connection runs
/// on its own tracked task.
pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    shared.tracker.spawn(serve_client(Arc::clone(&shared), stream, peer));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

/// Waits for connection tasks to finish. With a timeout, whatever is
/// still live when it expires is force-closed.
pub(crate) async fn drain(shared: &Shared, timeout: Option<Duration>) -> Result<()> {
    shared.tracker.close();
    let Some(timeout) = timeout else {
        shared.tracker.wait().await;
        return Ok(());
    };

    if tokio::time::timeout(timeout, shared.tracker.wait())
        .await
        .is_ok()
    {
        return Ok(());
    }

    let live: Vec<_> = shared.live.lock().values().cloned().collect();
    warn!(count = live.len(), "shutdown timed out, closing live connections");
    for ctx in live {
        ctx.close_client();
    }
    Err(ProxyError::ShutdownTimeout(timeout))
}

async fn serve_client(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let (ctx, stream) = match ConnContext::accept(stream, peer, shared.addons.clone()) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(%peer, "failed to set up connection: {e}");
            return;
        }
    };
    shared.live.lock().insert(ctx.id, Arc::clone(&ctx));

    serve_http(Arc::clone(&shared), Arc::clone(&ctx), stream, None).await;

    let tunnel = ctx.tunnel.lock().take();
    if let Some(tunnel) = tunnel {
        let _ = tunnel.await;
    }

    ctx.close_client();
    shared.live.lock().remove(&ctx.id);
}

/// Runs the HTTP/1.1 server loop over `stream`. `tunnel` carries the
/// CONNECT authority when the stream is a decrypted tunnel.
pub(crate) async fn serve_http<S: Io>(
    shared: Arc<Shared>,
    ctx: Arc<ConnContext>,
    stream: S,
    tunnel: Option<Arc<str>>,
) {
    let service = {
        let shared = Arc::clone(&shared);
        let ctx = Arc::clone(&ctx);
        service_fn(move |req| {
            let shared = Arc::clone(&shared);
            let ctx = Arc::clone(&ctx);
            let tunnel = tunnel.clone();
            async move { Ok::<_, Infallible>(route(shared, ctx, req, tunnel).await) }
        })
    };

    let conn = hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            served = conn.as_mut() => {
                match served {
                    Ok(()) => {}
                    Err(e) if is_benign_hyper(&e) => debug!(conn = %ctx.id, "connection ended: {e}"),
                    Err(e) => warn!(conn = %ctx.id, "connection failed: {e}"),
                }
                break;
            }
            _ = shared.shutdown.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = ctx.client.closed() => break,
        }
    }
}

async fn route(
    shared: Arc<Shared>,
    ctx: Arc<ConnContext>,
    mut req: Request<Incoming>,
    tunnel: Option<Arc<str>>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        if tunnel.is_some() {
            return body::response(StatusCode::METHOD_NOT_ALLOWED, "");
        }
        return intercept::handle_connect(shared, ctx, req).await;
    }

    if let Some(authority) = &tunnel {
        absolutize(&mut req, authority);
    }

    if req.uri().authority().is_none() {
        return direct_access(&shared, &req);
    }

    if tunnel.is_none() {
        let intercept = shared.should_intercept(&flow::Request::from_head(&req));
        ctx.set_intercept(intercept);
        if !intercept {
            return relay::forward_http(&shared.dialer, &ctx, req).await;
        }
    }

    if relay::is_upgrade(&req) {
        return bridge::upgrade(&shared, req).await;
    }

    bridge::exchange(&shared, &ctx, req).await
}

/// Answers a request addressed to the proxy itself.
fn direct_access(shared: &Shared, req: &Request<Incoming>) -> Response<ProxyBody> {
    let request = flow::Request::from_head(req);
    let mut response = None;
    shared.addons.access_proxy_server(&request, &mut response);

    match response {
        Some(response) => response.into_hyper(None),
        None => body::response(StatusCode::BAD_REQUEST, DIRECT_ACCESS_MESSAGE),
    }
}

/// Resolves an origin-form target inside a tunnel to an absolute
/// `https://` URL, preferring the `Host` header over the CONNECT authority.
fn absolutize<B>(req: &mut Request<B>, authority: &str) {
    if req.uri().authority().is_some() {
        return;
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or(authority);
    let path = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let uri = format!("https://{host}{path}").parse::<Uri>();

    match uri {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => debug!(host, "cannot resolve tunnel request target: {e}"),
    }
}

pub(crate) fn log_started(addr: SocketAddr, shared: &Shared) {
    info!(
        %addr,
        addons = shared.addons.len(),
        stream_large_bodies = shared.options.stream_threshold(),
        ssl_insecure = shared.options.ssl_insecure,
        "proxy listening"
    );
}
