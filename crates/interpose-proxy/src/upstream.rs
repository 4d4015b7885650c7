//! Upstream dialing: direct, through an upstream HTTP(S) proxy, and TLS.
//!
//! The upstream proxy for a request is chosen in order from the dynamic
//! selector set on the proxy, the static `upstream` option, and the
//! `HTTPS_PROXY`/`HTTP_PROXY` environment (honoring `NO_PROXY`). Loopback
//! targets never go through an environment proxy.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Uri};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::body;
use crate::connection::{ConnContext, ServerConn};
use crate::error::{ProxyError, Result};
use crate::flow::Request;
use crate::host_port::{join_host_port, split_host_port};
use crate::options::Options;

/// A bidirectional byte stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// A type-erased upstream stream.
pub type BoxedIo = Box<dyn Io>;

/// Picks an upstream proxy URL for a request; `None` dials directly.
pub type UpstreamProxyFn = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// A parsed upstream proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    /// `host:port` of the proxy.
    pub address: String,
    /// Proxy host, used as the TLS server name for `https://` proxies.
    pub host: String,
    pub tls: bool,
    auth: Option<HeaderValue>,
}

impl UpstreamProxy {
    /// Parses `http://[user:pass@]host[:port]` or the `https://` form.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || ProxyError::InvalidUpstreamProxy(raw.to_string());

        let uri: Uri = raw.parse().map_err(|_| invalid())?;
        let tls = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => true,
            Some(s) if s.eq_ignore_ascii_case("http") => false,
            _ => return Err(invalid()),
        };
        let authority = uri.authority().ok_or_else(invalid)?.as_str();

        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(userinfo), host_port),
            None => (None, authority),
        };
        let (host, port) = split_host_port(host_port);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            "" if tls => "443",
            "" => "80",
            port => port,
        };

        let auth = userinfo
            .map(|userinfo| {
                let token = STANDARD.encode(userinfo);
                HeaderValue::from_str(&format!("Basic {token}")).map_err(|_| invalid())
            })
            .transpose()?;

        Ok(Self {
            address: join_host_port(host, port),
            host: host.to_string(),
            tls,
            auth,
        })
    }
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

/// Opens upstream connections on behalf of clients.
pub struct Dialer {
    upstream: Option<UpstreamProxy>,
    dynamic: Option<UpstreamProxyFn>,
    tls: TlsConnector,
}

impl Dialer {
    pub fn new(options: &Options, dynamic: Option<UpstreamProxyFn>) -> Result<Self> {
        let upstream = options
            .upstream
            .as_deref()
            .map(UpstreamProxy::parse)
            .transpose()?;

        Ok(Self {
            upstream,
            dynamic,
            tls: TlsConnector::from(client_config(options.ssl_insecure)?),
        })
    }

    /// Chooses the upstream proxy for `request`.
    pub fn proxy_for(&self, request: &Request) -> Result<Option<UpstreamProxy>> {
        if let Some(select) = &self.dynamic {
            if let Some(raw) = select(request) {
                return UpstreamProxy::parse(&raw).map(Some);
            }
        }
        if let Some(proxy) = &self.upstream {
            return Ok(Some(proxy.clone()));
        }
        match proxy_from_env(&request.url, |key| std::env::var(key).ok()) {
            Some(raw) => UpstreamProxy::parse(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Dials `address` for the client of `ctx` and registers the resulting
    /// server connection. Aborts if the client goes away first.
    pub async fn connect(
        &self,
        ctx: &ConnContext,
        address: &str,
        request: &Request,
    ) -> Result<(Arc<ServerConn>, BoxedIo)> {
        let proxy = self.proxy_for(request)?;

        let (server, io) = tokio::select! {
            biased;
            _ = ctx.client.disconnected() => return Err(ProxyError::Cancelled),
            dialed = self.dial(address, proxy.as_ref()) => dialed?,
        };

        let server = Arc::new(server);
        ctx.attach_server(Arc::clone(&server));
        Ok((server, io))
    }

    /// Performs the TLS handshake with the upstream and fires
    /// `tls_established_server`. Aborts if the client goes away first.
    pub async fn handshake(
        &self,
        ctx: &ConnContext,
        server: &ServerConn,
        io: BoxedIo,
        server_name: &str,
    ) -> Result<TlsStream<BoxedIo>> {
        let tls = tokio::select! {
            biased;
            _ = ctx.client.disconnected() => return Err(ProxyError::Cancelled),
            tls = self.tls_wrap(io, server_name) => tls?,
        };

        server.set_tls(true);
        ctx.addons().tls_established_server(ctx, server);
        Ok(tls)
    }

    /// Dials `address` directly for a request that is not intercepted. The
    /// connection is not tracked as the client's server connection.
    /// Aborts if the client goes away first.
    pub async fn connect_direct(&self, ctx: &ConnContext, address: &str) -> Result<TcpStream> {
        tokio::select! {
            biased;
            _ = ctx.client.disconnected() => Err(ProxyError::Cancelled),
            tcp = TcpStream::connect(address) => tcp.map_err(|source| ProxyError::Dial {
                address: address.to_string(),
                source,
            }),
        }
    }

    /// Opens a connection to `address` that is not tracked as the
    /// client's server connection. `server_name` adds a TLS layer.
    pub async fn open(
        &self,
        address: &str,
        request: &Request,
        server_name: Option<&str>,
    ) -> Result<BoxedIo> {
        let proxy = self.proxy_for(request)?;
        let (_, io) = self.dial(address, proxy.as_ref()).await?;
        match server_name {
            Some(name) => Ok(Box::new(self.tls_wrap(io, name).await?)),
            None => Ok(io),
        }
    }

    async fn dial(
        &self,
        address: &str,
        proxy: Option<&UpstreamProxy>,
    ) -> Result<(ServerConn, BoxedIo)> {
        let target = proxy.map_or(address, |p| p.address.as_str());
        let tcp = TcpStream::connect(target)
            .await
            .map_err(|source| ProxyError::Dial {
                address: target.to_string(),
                source,
            })?;
        let (server, tcp) = ServerConn::new(address, tcp)?;

        let io: BoxedIo = match proxy {
            None => Box::new(tcp),
            Some(proxy) if proxy.tls => {
                let tls = self.tls_wrap(Box::new(tcp), &proxy.host).await?;
                tunnel_through(tls, address, proxy.auth.clone()).await?
            }
            Some(proxy) => tunnel_through(tcp, address, proxy.auth.clone()).await?,
        };

        debug!(address, via = ?proxy.map(|p| &p.address), "dialed upstream");
        Ok((server, io))
    }

    async fn tls_wrap(&self, io: BoxedIo, server_name: &str) -> Result<TlsStream<BoxedIo>> {
        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            ProxyError::Handshake {
                peer: server_name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            }
        })?;

        self.tls
            .connect(name, io)
            .await
            .map_err(|source| ProxyError::Handshake {
                peer: server_name.to_string(),
                source,
            })
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("upstream", &self.upstream)
            .field("dynamic", &self.dynamic.is_some())
            .finish_non_exhaustive()
    }
}

/// Asks an upstream proxy to open a tunnel to `target`.
async fn tunnel_through<S: Io>(
    io: S,
    target: &str,
    auth: Option<HeaderValue>,
) -> Result<BoxedIo> {
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, body::ProxyBody>(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("upstream proxy connection ended: {e}");
        }
    });

    let mut req = hyper::Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(HOST, target);
    if let Some(auth) = auth {
        req = req.header(PROXY_AUTHORIZATION, auth);
    }

    let res = sender.send_request(req.body(body::empty())?).await?;
    if !res.status().is_success() {
        return Err(ProxyError::Dial {
            address: target.to_string(),
            source: io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("upstream proxy answered {}", res.status()),
            ),
        });
    }

    let upgraded = hyper::upgrade::on(res).await?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

/// Reads the proxy for `url` from the environment via `get`.
fn proxy_from_env(url: &Uri, get: impl Fn(&str) -> Option<String>) -> Option<String> {
    let host = url.host()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if is_loopback(host) {
        return None;
    }

    let no_proxy = get("NO_PROXY").or_else(|| get("no_proxy"));
    if no_proxy.is_some_and(|list| no_proxy_matches(host, &list)) {
        return None;
    }

    let keys: &[&str] = if url.scheme_str() == Some("https") {
        &["HTTPS_PROXY", "https_proxy"]
    } else {
        &["HTTP_PROXY", "http_proxy"]
    };
    keys.iter()
        .find_map(|key| get(*key))
        .filter(|value| !value.is_empty())
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Whether `host` matches an entry in a comma-separated `NO_PROXY` list.
/// Entries match the host itself or any subdomain; `*` matches everything.
fn no_proxy_matches(host: &str, list: &str) -> bool {
    let host = host.to_ascii_lowercase();
    list.split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let (entry_host, _) = split_host_port(&entry);
            let suffix = entry_host.trim_start_matches('.');
            host == suffix || host.ends_with(&format!(".{suffix}"))
        })
}

/// Builds the client config used towards upstream servers.
pub fn client_config(insecure: bool) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accepts any upstream certificate. Signatures are still checked.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
