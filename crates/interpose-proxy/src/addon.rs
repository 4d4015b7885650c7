//! Addons: observers and mutators of proxy traffic.
//!
//! Every hook has a no-op default so an addon implements only what it
//! needs. Hooks run synchronously on the connection's task, in registration
//! order. A panicking addon is logged and skipped; the remaining addons and
//! the connection carry on.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, info};

use crate::connection::{ClientConn, ConnContext, ServerConn};
use crate::flow::{Flow, Request, Response};

/// Hooks invoked over the life of connections and flows.
#[allow(unused_variables)]
pub trait Addon: Send + Sync {
    /// Name used when logging failures of this addon.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// A client connected. Runs before any byte is read from it.
    fn client_connected(&self, client: &ClientConn) {}

    /// A client connection was closed.
    fn client_disconnected(&self, client: &ClientConn) {}

    /// An upstream connection was established.
    fn server_connected(&self, ctx: &ConnContext, server: &ServerConn) {}

    /// An upstream connection was closed.
    fn server_disconnected(&self, ctx: &ConnContext, server: &ServerConn) {}

    /// The TLS handshake with the upstream completed.
    fn tls_established_server(&self, ctx: &ConnContext, server: &ServerConn) {}

    /// A request head was parsed and a flow started.
    fn begin_flow(&self, flow: &Flow) {}

    /// The request is available. Setting `flow.response` answers the
    /// client without contacting the upstream.
    fn request(&self, flow: &mut Flow) {}

    /// The response is available.
    fn response(&self, flow: &mut Flow) {}

    /// The flow is complete. Fires exactly once per flow.
    fn end_flow(&self, flow: &Flow) {}

    /// A request addressed to the proxy itself rather than through it.
    /// Setting `response` answers it.
    fn access_proxy_server(&self, request: &Request, response: &mut Option<Response>) {}
}

/// An ordered, immutable set of addons with panic-isolated dispatch.
#[derive(Clone, Default)]
pub struct Addons {
    addons: Arc<[Arc<dyn Addon>]>,
}

impl Addons {
    pub fn new(addons: Vec<Arc<dyn Addon>>) -> Self {
        Self {
            addons: addons.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    fn each(&self, hook: &'static str, mut call: impl FnMut(&dyn Addon)) {
        for addon in self.addons.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(addon.as_ref())));
            if let Err(panic) = outcome {
                error!(
                    addon = addon.name(),
                    hook,
                    "addon panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub fn client_connected(&self, client: &ClientConn) {
        self.each("client_connected", |a| a.client_connected(client));
    }

    pub fn client_disconnected(&self, client: &ClientConn) {
        self.each("client_disconnected", |a| a.client_disconnected(client));
    }

    pub fn server_connected(&self, ctx: &ConnContext, server: &ServerConn) {
        self.each("server_connected", |a| a.server_connected(ctx, server));
    }

    pub fn server_disconnected(&self, ctx: &ConnContext, server: &ServerConn) {
        self.each("server_disconnected", |a| a.server_disconnected(ctx, server));
    }

    pub fn tls_established_server(&self, ctx: &ConnContext, server: &ServerConn) {
        self.each("tls_established_server", |a| {
            a.tls_established_server(ctx, server)
        });
    }

    pub fn begin_flow(&self, flow: &Flow) {
        self.each("begin_flow", |a| a.begin_flow(flow));
    }

    pub fn request(&self, flow: &mut Flow) {
        self.each("request", |a| a.request(flow));
    }

    pub fn response(&self, flow: &mut Flow) {
        self.each("response", |a| a.response(flow));
    }

    pub fn end_flow(&self, flow: &Flow) {
        self.each("end_flow", |a| a.end_flow(flow));
    }

    pub fn access_proxy_server(&self, request: &Request, response: &mut Option<Response>) {
        self.each("access_proxy_server", |a| {
            a.access_proxy_server(request, response)
        });
    }
}

impl fmt::Debug for Addons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.addons.iter().map(|a| a.name()))
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Logs connections and a one-line summary per flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAddon;

impl Addon for LogAddon {
    fn name(&self) -> &str {
        "log"
    }

    fn client_connected(&self, client: &ClientConn) {
        info!(client = %client.peer_addr, "client connected");
    }

    fn client_disconnected(&self, client: &ClientConn) {
        info!(client = %client.peer_addr, "client disconnected");
    }

    fn server_connected(&self, ctx: &ConnContext, server: &ServerConn) {
        info!(
            client = %ctx.client.peer_addr,
            server = %server.address,
            "server connected"
        );
    }

    fn server_disconnected(&self, ctx: &ConnContext, server: &ServerConn) {
        info!(
            client = %ctx.client.peer_addr,
            server = %server.address,
            "server disconnected"
        );
    }

    fn request(&self, flow: &mut Flow) {
        info!(
            client = %flow.conn().client.peer_addr,
            method = %flow.request.method,
            url = %flow.request.url,
            "request"
        );
    }

    fn end_flow(&self, flow: &Flow) {
        let client = flow.conn().client.peer_addr;
        let (status, length) = match &flow.response {
            Some(res) => (
                res.status.as_u16(),
                res.body.as_ref().map_or(0, |b| b.len()),
            ),
            None => (0, 0),
        };
        info!(
            %client,
            method = %flow.request.method,
            url = %flow.request.url,
            status,
            length,
            elapsed_ms = flow.elapsed().as_millis() as u64,
            "flow complete"
        );
    }
}

/// Sets the upstream dialing policy for every client.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamCertAddon {
    eager: bool,
}

impl UpstreamCertAddon {
    /// `eager` dials upstream before the client handshake; otherwise the
    /// first request inside the tunnel triggers the dial.
    pub fn new(eager: bool) -> Self {
        Self { eager }
    }
}

impl Addon for UpstreamCertAddon {
    fn name(&self) -> &str {
        "upstream_cert"
    }

    fn client_connected(&self, client: &ClientConn) {
        client.set_upstream_cert(self.eager);
    }
}
