//! CONNECT handling: raw tunnels and TLS interception.
//!
//! A tunnel that is not intercepted is dialed up front and relayed byte for
//! byte. An intercepted tunnel peeks at the first client bytes: anything
//! other than a TLS handshake is relayed raw, a TLS handshake is terminated
//! here with a leaf minted for the client's SNI and the decrypted stream is
//! served through the replay bridge.
//!
//! Eager mode dials (and TLS-handshakes) the upstream before answering the
//! client, so the upstream's SNI matches what the client asked for. Lazy
//! mode, the default, defers the dial to the first request inside the
//! tunnel.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::body::{self, ProxyBody};
use crate::bridge::{self, UpstreamSession};
use crate::connection::{ConnContext, ServerConn};
use crate::entry::Shared;
use crate::error::{ProxyError, Result};
use crate::flow::{self, Flow};
use crate::host_port::target_addr;
use crate::relay::{self, log_error};
use crate::upstream::{BoxedIo, Io};

/// How a CONNECT tunnel is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Not intercepted: relay raw bytes.
    Direct,
    /// Intercepted, upstream dialed before the client handshake.
    Eager,
    /// Intercepted, upstream dialed on the first request.
    Lazy,
}

/// Reports whether `peek` starts a TLS handshake record.
pub fn is_tls(peek: &[u8]) -> bool {
    peek.len() >= 3 && peek[0] == 0x16 && peek[1] == 0x03 && peek[2] <= 0x03
}

/// Answers a CONNECT request and spawns the tunnel task.
pub(crate) async fn handle_connect(
    shared: Arc<Shared>,
    ctx: Arc<ConnContext>,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let (address, host) = target_addr(&authority, "443");

    let request = flow::Request::from_head(&req);
    let intercept = shared.should_intercept(&request);
    ctx.set_intercept(intercept);

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        log_error("connect", &ProxyError::HijackUnsupported);
        return body::response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::HijackUnsupported.to_string(),
        );
    };

    let mode = if !intercept {
        TunnelMode::Direct
    } else if ctx.client.upstream_cert() {
        TunnelMode::Eager
    } else {
        TunnelMode::Lazy
    };
    debug!(conn = %ctx.id, %address, ?mode, "CONNECT");

    ctx.next_flow();
    let mut flow = Flow::new(Arc::clone(&ctx), request);
    shared.addons.begin_flow(&flow);

    let dial_request = dial_request(&authority);
    let dialed = match mode {
        TunnelMode::Direct | TunnelMode::Eager => {
            match shared.dialer.connect(&ctx, &address, &dial_request).await {
                Ok(dialed) => Some(dialed),
                Err(e) => {
                    log_error("connect", &e);
                    flow.response = Some(flow::Response::new(StatusCode::BAD_GATEWAY));
                    flow.finish();
                    return body::response(StatusCode::BAD_GATEWAY, "");
                }
            }
        }
        TunnelMode::Lazy => None,
    };

    flow.response = Some(flow::Response::new(StatusCode::OK));

    let tunnel = Tunnel {
        shared,
        ctx: Arc::clone(&ctx),
        mode,
        address,
        host,
        authority,
        dial_request,
    };
    let task = tokio::spawn(tunnel.run(flow, on_upgrade, dialed));
    *ctx.tunnel.lock() = Some(task);

    let mut res = Response::new(body::empty());
    res.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    res
}

/// The request the upstream dialer sees for a tunnel.
fn dial_request(authority: &str) -> flow::Request {
    let url = format!("https://{authority}/")
        .parse()
        .unwrap_or_else(|_| hyper::Uri::from_static("/"));
    flow::Request::new(Method::CONNECT, url)
}

struct Tunnel {
    shared: Arc<Shared>,
    ctx: Arc<ConnContext>,
    mode: TunnelMode,
    address: String,
    host: String,
    authority: String,
    dial_request: flow::Request,
}

impl Tunnel {
    async fn run(
        self,
        flow: Flow,
        on_upgrade: OnUpgrade,
        dialed: Option<(Arc<ServerConn>, BoxedIo)>,
    ) {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client = PeekStream::new(TokioIo::new(upgraded));
                if let Err(e) = self.relay(client, dialed).await {
                    log_error("tunnel", &e);
                }
            }
            Err(e) => debug!(conn = %self.ctx.id, "CONNECT upgrade failed: {e}"),
        }
        flow.finish();
    }

    async fn relay<S: Io>(
        &self,
        mut client: PeekStream<S>,
        dialed: Option<(Arc<ServerConn>, BoxedIo)>,
    ) -> Result<()> {
        if self.mode == TunnelMode::Direct {
            if let Some((_, server)) = dialed {
                relay::transfer(&self.ctx, client, server).await;
            }
            return Ok(());
        }

        let tls = is_tls(client.peek(3).await?);
        if !tls {
            let server = match dialed {
                Some((_, server)) => server,
                None => {
                    self.shared
                        .dialer
                        .connect(&self.ctx, &self.address, &self.dial_request)
                        .await?
                        .1
                }
            };
            relay::transfer(&self.ctx, client, server).await;
            return Ok(());
        }

        self.ctx.client.set_tls(true);
        self.intercept(client, dialed).await
    }

    async fn intercept<S: Io>(
        &self,
        client: PeekStream<S>,
        dialed: Option<(Arc<ServerConn>, BoxedIo)>,
    ) -> Result<()> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), client)
            .await
            .map_err(|source| self.handshake_error(source))?;

        let (name, offers_http11) = {
            let hello = start.client_hello();
            let offers_http11 = hello
                .alpn()
                .is_some_and(|mut protocols| protocols.any(|p| p == b"http/1.1"));
            let name = hello
                .server_name()
                .map_or_else(|| self.host.clone(), str::to_string);
            (name, offers_http11)
        };

        let session = match dialed {
            Some((server, io)) => {
                let upstream = self
                    .shared
                    .dialer
                    .handshake(&self.ctx, &server, io, &name)
                    .await?;
                let session =
                    UpstreamSession::start(&self.ctx, server, self.address.clone(), upstream, true)
                        .await?;
                Some(session)
            }
            None => None,
        };

        let cert = self.shared.ca.mint(&name)?;
        let config = tls_server_config(cert, offers_http11)?;
        let stream = start
            .into_stream(config)
            .await
            .map_err(|source| self.handshake_error(source))?;

        debug!(conn = %self.ctx.id, %name, eager = session.is_some(), "intercepting TLS");
        bridge::serve(
            Arc::clone(&self.shared),
            Arc::clone(&self.ctx),
            stream,
            self.authority.clone(),
            session,
        )
        .await;
        Ok(())
    }

    fn handshake_error(&self, source: io::Error) -> ProxyError {
        ProxyError::Handshake {
            peer: self.ctx.client.peer_addr.to_string(),
            source,
        }
    }
}

/// Builds the client-facing config presenting `cert`. HTTP/1.1 is
/// advertised only when the client offered it.
pub fn tls_server_config(cert: Arc<CertifiedKey>, alpn_http11: bool) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(MintedCert(cert)));

    if alpn_http11 {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
    }
    Ok(Arc::new(config))
}

/// Resolves every handshake to one minted certificate.
#[derive(Debug)]
struct MintedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for MintedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// A stream that can look ahead at incoming bytes without consuming them.
pub struct PeekStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Returns the next `n` bytes without consuming them. Fails with
    /// `UnexpectedEof` if the stream ends first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(&self.buf[self.pos..self.pos + n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffered().is_empty() {
            let n = self.buffered().len().min(out.remaining());
            let start = self.pos;
            out.put_slice(&self.buf[start..start + n]);
            self.pos += n;
            if self.pos == self.buf.len() {
                self.buf = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
