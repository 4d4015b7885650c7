//! Proxy options.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::DEFAULT_PROXY_PORT;

/// Bodies larger than this are streamed instead of buffered.
pub const DEFAULT_STREAM_LARGE_BODIES: u64 = 5 * 1024 * 1024;

/// Immutable proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Body size threshold above which bodies stream through unbuffered.
    pub stream_large_bodies: u64,
    /// Skip verification of upstream server certificates.
    pub ssl_insecure: bool,
    /// Directory holding the root CA. `None` uses the platform data dir.
    pub ca_root_path: Option<PathBuf>,
    /// Static upstream proxy URL (`http://[user:pass@]host:port`).
    pub upstream: Option<String>,
    /// Grace period for in-flight connections on shutdown. `None` waits
    /// indefinitely.
    pub shutdown_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
            ssl_insecure: false,
            ca_root_path: None,
            upstream: None,
            shutdown_timeout: None,
        }
    }
}

impl Options {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the streaming threshold. Zero restores the default.
    pub fn with_stream_large_bodies(mut self, bytes: u64) -> Self {
        self.stream_large_bodies = bytes;
        self
    }

    /// Disables upstream certificate verification.
    pub fn with_ssl_insecure(mut self, insecure: bool) -> Self {
        self.ssl_insecure = insecure;
        self
    }

    /// Sets the root CA directory.
    pub fn with_ca_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_root_path = Some(path.into());
        self
    }

    /// Sets a static upstream proxy.
    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// The effective streaming threshold.
    pub fn stream_threshold(&self) -> u64 {
        match self.stream_large_bodies {
            0 => DEFAULT_STREAM_LARGE_BODIES,
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(opts.stream_threshold(), 5 * 1024 * 1024);
        assert!(!opts.ssl_insecure);
        assert!(opts.upstream.is_none());
        assert!(opts.shutdown_timeout.is_none());
    }

    #[test]
    fn zero_threshold_means_default() {
        let opts = Options::new().with_stream_large_bodies(0);
        assert_eq!(opts.stream_threshold(), DEFAULT_STREAM_LARGE_BODIES);

        let opts = Options::new().with_stream_large_bodies(1024);
        assert_eq!(opts.stream_threshold(), 1024);
    }

    #[test]
    fn builders_chain() {
        let opts = Options::new()
            .with_port(8888)
            .with_ssl_insecure(true)
            .with_upstream("http://127.0.0.1:3128")
            .with_ca_root_path("/tmp/ca")
            .with_shutdown_timeout(Duration::from_secs(3));

        assert_eq!(opts.addr, SocketAddr::from(([127, 0, 0, 1], 8888)));
        assert!(opts.ssl_insecure);
        assert_eq!(opts.upstream.as_deref(), Some("http://127.0.0.1:3128"));
        assert_eq!(opts.ca_root_path, Some(PathBuf::from("/tmp/ca")));
        assert_eq!(opts.shutdown_timeout, Some(Duration::from_secs(3)));
    }
}
