//! Error types for the proxy.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listener could not be bound. Fatal at startup.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An upstream (or upstream proxy) connection could not be opened.
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A client- or server-facing TLS handshake failed.
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// The client transport cannot be taken over for raw access.
    #[error("connection hijacking not supported")]
    HijackUnsupported,

    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP protocol error from hyper.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// A request or response could not be assembled.
    #[error("invalid HTTP message: {0}")]
    InvalidMessage(#[from] hyper::http::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The upstream proxy setting could not be used.
    #[error("invalid upstream proxy: {0}")]
    InvalidUpstreamProxy(String),

    /// The client went away while an upstream operation was pending.
    #[error("cancelled: client disconnected")]
    Cancelled,

    /// In-flight connections did not finish within the grace period.
    #[error("shutdown did not complete within {0:?}, live connections were force-closed")]
    ShutdownTimeout(Duration),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to mint a leaf certificate.
    #[error("Failed to mint certificate for {name}: {reason}")]
    Mint { name: String, reason: String },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Returns true for errors that are a normal part of connections going
    /// away (resets, broken pipes, timeouts, use of a closed connection).
    pub fn is_benign(&self) -> bool {
        match self {
            ProxyError::Io(err) => is_benign_io(err),
            ProxyError::Dial { source, .. } | ProxyError::Handshake { source, .. } => {
                is_benign_io(source)
            }
            ProxyError::Http(err) => is_benign_hyper(err),
            ProxyError::Cancelled => true,
            _ => false,
        }
    }
}

/// Classifies an IO error as an expected connection teardown.
pub fn is_benign_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Classifies a hyper error as an expected connection teardown.
pub fn is_benign_hyper(err: &hyper::Error) -> bool {
    if err.is_closed() || err.is_canceled() || err.is_incomplete_message() || err.is_timeout() {
        return true;
    }
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return is_benign_io(io_err);
        }
        source = cause.source();
    }
    false
}
