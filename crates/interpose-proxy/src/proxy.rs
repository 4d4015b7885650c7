//! Intercepting proxy server.
//!
//! [`Proxy`] owns the configuration, the certificate authority and the
//! addon registry. It binds a listener, serves connections until shutdown
//! is requested and then drains them.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::addon::{Addon, Addons};
use crate::ca::{CaManager, CertificateAuthority};
use crate::entry::{self, InterceptFn, Shared};
use crate::error::{ProxyError, Result};
use crate::flow::Request;
use crate::options::Options;
use crate::upstream::UpstreamProxyFn;

/// An intercepting HTTP(S) proxy.
pub struct Proxy {
    options: Options,
    ca: Arc<dyn CertificateAuthority>,
    addons: Vec<Arc<dyn Addon>>,
    should_intercept: Option<InterceptFn>,
    upstream_proxy: Option<UpstreamProxyFn>,
    shutdown: CancellationToken,
}

impl Proxy {
    /// Creates a proxy with a file-backed CA, generating the root on first
    /// use. The CA lives in `options.ca_root_path` or the platform data
    /// directory.
    pub fn new(options: Options) -> Result<Self> {
        let manager = match &options.ca_root_path {
            Some(path) => CaManager::new(path),
            None => CaManager::with_default_dir()?,
        };
        let ca = manager.ensure_ca()?;
        tracing::debug!(cert = %manager.cert_path().display(), "CA loaded");
        Ok(Self::with_ca(options, Arc::new(ca)))
    }

    /// Creates a proxy that mints leaves from `ca`.
    pub fn with_ca(options: Options, ca: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            options,
            ca,
            addons: Vec::new(),
            should_intercept: None,
            upstream_proxy: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Registers an addon. Hooks run in registration order.
    pub fn add_addon(&mut self, addon: Arc<dyn Addon>) {
        self.addons.push(addon);
    }

    /// Sets the predicate deciding which requests and tunnels are
    /// intercepted. Without one everything is.
    pub fn set_should_intercept<F>(&mut self, predicate: F)
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.should_intercept = Some(Arc::new(predicate));
    }

    /// Sets a per-request upstream proxy selector. Returning `None` falls
    /// back to the static upstream and then the environment.
    pub fn set_upstream_proxy<F>(&mut self, select: F)
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.upstream_proxy = Some(Arc::new(select));
    }

    /// The root certificate leaves chain to, as DER.
    pub fn root_certificate(&self) -> CertificateDer<'static> {
        self.ca.root()
    }

    /// The root certificate as PEM, for installing into trust stores.
    pub fn root_certificate_pem(&self) -> String {
        self.ca.root_pem()
    }

    /// Returns the leaf presented to clients for `name`.
    pub fn certificate_for(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        Ok(self.ca.mint(name)?)
    }

    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Requests shutdown of a serving proxy.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A token that shuts the proxy down when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured address.
    pub async fn listen(&self) -> Result<TcpListener> {
        let addr = self.options.addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Listen { addr, source })
    }

    /// Serves `listener` until shutdown is requested, then waits for open
    /// connections up to `shutdown_timeout`.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let timeout = self.options.shutdown_timeout;
        let shared = Arc::new(Shared::new(
            self.options,
            Addons::new(self.addons),
            self.ca,
            self.should_intercept,
            self.upstream_proxy,
            self.shutdown,
        )?);

        entry::log_started(addr, &shared);
        entry::accept_loop(Arc::clone(&shared), listener).await;

        tracing::info!("Proxy shutting down");
        entry::drain(&shared, timeout).await?;
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy and runs it until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = self.listen().await?;
        let token = self.shutdown_token();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            token.cancel();
        });
        self.serve(listener).await
    }

    /// Starts the proxy in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = self.listen().await?;
        let addr = listener.local_addr()?;
        let shutdown = self.shutdown_token();
        let handle = tokio::spawn(self.serve(listener));

        Ok(ProxyHandle {
            shutdown,
            addr,
            handle,
        })
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("options", &self.options)
            .field("addons", &self.addons.len())
            .field("should_intercept", &self.should_intercept.is_some())
            .field("upstream_proxy", &self.upstream_proxy.is_some())
            .finish()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown: CancellationToken,
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) -> Result<()> {
        self.handle.await.map_err(std::io::Error::other)?
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}
