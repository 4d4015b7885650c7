//! Shared fixtures: a proxy on an ephemeral port, local upstream servers,
//! clients speaking through the proxy and a recording addon.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use interpose_proxy::intercept::tls_server_config;
use interpose_proxy::{
    Addon, CaManager, CertificateAuthority, ClientConn, ConnContext, Flow, Options, Proxy,
    ProxyHandle, ServerConn,
};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub type Handler = Arc<dyn Fn(Parts, Bytes) -> Response<Full<Bytes>> + Send + Sync>;

/// A running proxy plus the directory holding its CA.
pub struct TestProxy {
    pub handle: ProxyHandle,
    pub root: CertificateDer<'static>,
    _dir: TempDir,
}

impl TestProxy {
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }
}

/// Starts a proxy on `127.0.0.1:0` trusting any upstream certificate.
pub async fn start_proxy(addons: Vec<Arc<dyn Addon>>) -> TestProxy {
    start_proxy_with(addons, |_| {}).await
}

pub async fn start_proxy_with(
    addons: Vec<Arc<dyn Addon>>,
    configure: impl FnOnce(&mut Proxy),
) -> TestProxy {
    let dir = TempDir::new().unwrap();
    let options = Options::default()
        .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_ca_root_path(dir.path().join("ca"))
        .with_ssl_insecure(true)
        .with_shutdown_timeout(Duration::from_secs(2));

    let mut proxy = Proxy::new(options).unwrap();
    for addon in addons {
        proxy.add_addon(addon);
    }
    configure(&mut proxy);

    let root = proxy.root_certificate();
    let handle = proxy.start().await.unwrap();
    TestProxy {
        handle,
        root,
        _dir: dir,
    }
}

/// A local origin server counting the connections it accepts.
pub struct Upstream {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    _dir: Option<TempDir>,
}

impl Upstream {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Polls until `n` connections were accepted or a second passes.
    pub async fn wait_accepted(&self, n: usize) -> usize {
        for _ in 0..100 {
            if self.accepted() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.accepted()
    }
}

/// Starts a plain HTTP origin answering every request with `handler`.
pub async fn http_upstream(
    handler: impl Fn(Parts, Bytes) -> Response<Full<Bytes>> + Send + Sync + 'static,
) -> Upstream {
    spawn_upstream(Arc::new(handler), None, None).await
}

/// Starts an HTTPS origin with its own CA and a leaf for `localhost`.
pub async fn https_upstream(
    handler: impl Fn(Parts, Bytes) -> Response<Full<Bytes>> + Send + Sync + 'static,
) -> Upstream {
    let dir = TempDir::new().unwrap();
    let ca = CaManager::new(dir.path()).ensure_ca().unwrap();
    let config = tls_server_config(ca.mint("localhost").unwrap(), true).unwrap();
    spawn_upstream(Arc::new(handler), Some(config), Some(dir)).await
}

async fn spawn_upstream(
    handler: Handler,
    tls: Option<Arc<ServerConfig>>,
    dir: Option<TempDir>,
) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let handler = Arc::clone(&handler);
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(config) => {
                        if let Ok(stream) = TlsAcceptor::from(config).accept(stream).await {
                            serve_origin(stream, handler).await;
                        }
                    }
                    None => serve_origin(stream, handler).await,
                }
            });
        }
    });

    Upstream {
        addr,
        accepted,
        _dir: dir,
    }
}

async fn serve_origin<S>(stream: S, handler: Handler)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move {
            let (parts, body) = req.into_parts();
            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::new(),
            };
            Ok::<_, Infallible>(handler(parts, bytes))
        }
    });

    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
}

/// Echoes the request path in the body.
pub fn echo_path(parts: Parts, _body: Bytes) -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::from(parts.uri.path().to_string())))
}

/// Opens an HTTP/1.1 client connection over `io`.
pub async fn client<S>(io: S) -> SendRequest<Full<Bytes>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender
}

/// Sends CONNECT for `authority` and reads the reply head byte by byte so
/// no tunnelled bytes are consumed.
pub async fn connect_tunnel(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    (stream, String::from_utf8(head).unwrap())
}

/// Completes a TLS handshake through an open tunnel, trusting only `root`.
pub async fn tls_through(
    tunnel: TcpStream,
    root: &CertificateDer<'static>,
    server_name: &str,
) -> TlsStream<TcpStream> {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let name = ServerName::try_from(server_name.to_string()).unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(name, tunnel)
        .await
        .unwrap()
}

/// Records every hook call as `"<hook>"` plus what response hooks saw.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub responses: Mutex<Vec<SeenResponse>>,
}

#[derive(Debug, Clone)]
pub struct SeenResponse {
    pub status: u16,
    pub content_length: Option<String>,
    pub buffered: bool,
    pub stream: bool,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, hook: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == hook).count()
    }

    /// Polls until `hook` fired `n` times or a second passes.
    pub async fn wait_for(&self, hook: &str, n: usize) -> usize {
        for _ in 0..100 {
            if self.count(hook) >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count(hook)
    }

    fn push(&self, hook: &str) {
        self.events.lock().push(hook.to_string());
    }
}

impl Addon for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn client_connected(&self, _client: &ClientConn) {
        self.push("client_connected");
    }

    fn client_disconnected(&self, _client: &ClientConn) {
        self.push("client_disconnected");
    }

    fn server_connected(&self, _ctx: &ConnContext, _server: &ServerConn) {
        self.push("server_connected");
    }

    fn server_disconnected(&self, _ctx: &ConnContext, _server: &ServerConn) {
        self.push("server_disconnected");
    }

    fn tls_established_server(&self, _ctx: &ConnContext, _server: &ServerConn) {
        self.push("tls_established_server");
    }

    fn begin_flow(&self, _flow: &Flow) {
        self.push("begin_flow");
    }

    fn request(&self, _flow: &mut Flow) {
        self.push("request");
    }

    fn response(&self, flow: &mut Flow) {
        self.push("response");
        if let Some(res) = &flow.response {
            self.responses.lock().push(SeenResponse {
                status: res.status.as_u16(),
                content_length: res
                    .headers
                    .get(hyper::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                buffered: res.body.is_some(),
                stream: flow.stream,
            });
        }
    }

    fn end_flow(&self, _flow: &Flow) {
        self.push("end_flow");
    }
}
