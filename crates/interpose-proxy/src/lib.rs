//! Interpose Proxy - an addon-driven intercepting HTTP(S) proxy.
//!
//! Clients configure this proxy as their HTTP proxy. Plain HTTP requests and
//! CONNECT tunnels are accepted on one listener; intercepted TLS tunnels are
//! terminated with leaf certificates minted from a local root CA and the
//! decrypted traffic is served through the same request path as plain HTTP.
//! [`Addon`]s observe and mutate every stage along the way.
//!
//! ## Architecture
//!
//! ```text
//! Client → Entry Router ─┬─ CONNECT ─→ Direct?  ── raw relay
//!                        │                │
//!                        │                └─ TLS? ── no ── raw relay
//!                        │                     │
//!                        │                    yes
//!                        │                     ▼
//!                        │               mint leaf, handshake
//!                        │                     │
//!                        │                     ▼
//!                        │               Replay Bridge ──┐
//!                        │                               ▼
//!                        ├─ absolute URL ─────────→ Exchange (hooks) → upstream
//!                        │
//!                        └─ origin form ──→ access_proxy_server / 400
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use interpose_proxy::{LogAddon, Options, Proxy};
//!
//! # async fn run() -> interpose_proxy::Result<()> {
//! let mut proxy = Proxy::new(Options::default().with_port(9080))?;
//! proxy.add_addon(Arc::new(LogAddon));
//! proxy.run().await
//! # }
//! ```

pub mod addon;
pub mod body;
mod bridge;
pub mod ca;
pub mod connection;
mod entry;
mod error;
pub mod flow;
pub mod host_port;
pub mod intercept;
mod options;
mod proxy;
pub mod relay;
pub mod upstream;

pub use addon::{Addon, Addons, LogAddon, UpstreamCertAddon};
pub use ca::{CaManager, CertificateAuthority, FileCa};
pub use connection::{ClientConn, ConnContext, ServerConn};
pub use entry::{InterceptFn, DIRECT_ACCESS_MESSAGE};
pub use error::{CaError, ProxyError, Result};
pub use flow::{Flow, Request, Response};
pub use host_port::{join_host_port, split_host_port};
pub use options::{Options, DEFAULT_STREAM_LARGE_BODIES};
pub use proxy::{Proxy, ProxyHandle};
pub use upstream::UpstreamProxyFn;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 9080;
