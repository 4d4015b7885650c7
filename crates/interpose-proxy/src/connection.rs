//! Connection lifecycle: client and server connection wrappers and the
//! per-client context tying them together.
//!
//! Each wrapper keeps a duplicate of its socket handle so it can shut the
//! transport down while another task owns the stream. Closing is idempotent:
//! the first call does the work and records its result, later calls return
//! the recorded result.
//!
//! Closing the client closes the server. Closing the server only ever
//! half-closes or force-closes the client transport, so the two close paths
//! never recurse into each other.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;
use uuid::Uuid;

use crate::addon::Addons;
use crate::bridge::UpstreamSession;

/// Outcome of the first close of a connection.
pub type CloseResult = std::result::Result<(), io::ErrorKind>;

/// Splits a tokio stream into itself plus a std handle to the same socket.
fn with_handle(stream: TcpStream) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let handle = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, handle))
}

/// Shuts a socket down, treating an already-disconnected socket as closed.
fn shutdown(socket: &std::net::TcpStream, how: Shutdown) -> CloseResult {
    match socket.shutdown(how) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e.kind()),
    }
}

/// Close bookkeeping shared by both connection wrappers.
struct CloseGuard {
    state: Mutex<Option<CloseResult>>,
    closed: CancellationToken,
}

impl CloseGuard {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Runs `close` on the first call only. Returns whether this call was
    /// the first, and the recorded result.
    fn close_once(&self, close: impl FnOnce() -> CloseResult) -> (bool, CloseResult) {
        let mut state = self.state.lock();
        if let Some(result) = *state {
            return (false, result);
        }
        let result = close();
        *state = Some(result);
        self.closed.cancel();
        (true, result)
    }
}

/// The accepted client transport.
pub struct ClientConn {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    tls: AtomicBool,
    upstream_cert: AtomicBool,
    socket: std::net::TcpStream,
    guard: CloseGuard,
}

impl ClientConn {
    /// Whether this proxy terminated TLS on the connection.
    pub fn tls(&self) -> bool {
        self.tls.load(Ordering::Acquire)
    }

    pub(crate) fn set_tls(&self, tls: bool) {
        self.tls.store(tls, Ordering::Release);
    }

    /// Whether CONNECT tunnels dial upstream before the client handshake.
    /// Off by default: tunnels dial lazily once the ClientHello is read.
    pub fn upstream_cert(&self) -> bool {
        self.upstream_cert.load(Ordering::Acquire)
    }

    /// Chooses eager (`true`) or lazy (`false`) upstream dialing.
    pub fn set_upstream_cert(&self, eager: bool) {
        self.upstream_cert.store(eager, Ordering::Release);
    }

    /// Resolves once the transport has been closed by any path.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.guard.closed.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.closed.is_cancelled()
    }

    /// Resolves once the transport is closed or the client hangs up its
    /// end. Bytes the client already sent stay unread.
    pub async fn disconnected(&self) {
        tokio::select! {
            biased;
            _ = self.closed() => {}
            _ = self.hung_up() => {}
        }
    }

    /// Watches a duplicate of the socket for end of stream. A client that
    /// is sending data has not hung up.
    async fn hung_up(&self) {
        let watch = match self.socket.try_clone().and_then(TcpStream::from_std) {
            Ok(watch) => watch,
            Err(e) => {
                debug!(client = %self.id, "cannot watch client for hangup: {e}");
                return std::future::pending().await;
            }
        };
        let mut byte = [0u8; 1];
        match watch.peek(&mut byte).await {
            Ok(0) => {}
            Ok(_) => std::future::pending().await,
            Err(e) => debug!(client = %self.id, "client socket failed: {e}"),
        }
    }

    /// A token cancelled when the client goes away.
    pub fn close_token(&self) -> CancellationToken {
        self.guard.closed.clone()
    }

    /// Stops reading from the client; pending writes still flush.
    pub fn close_read(&self) {
        if let Err(kind) = shutdown(&self.socket, Shutdown::Read) {
            debug!(client = %self.id, "client read shutdown failed: {kind}");
        }
    }

    /// Closes the transport without running the close routine or hooks.
    pub fn force_close(&self) {
        if let Err(kind) = shutdown(&self.socket, Shutdown::Both) {
            debug!(client = %self.id, "client shutdown failed: {kind}");
        }
        self.guard.closed.cancel();
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls())
            .field("upstream_cert", &self.upstream_cert())
            .finish()
    }
}

/// An upstream transport dialed on behalf of a client.
pub struct ServerConn {
    pub id: Uuid,
    /// The `host:port` that was dialed.
    pub address: String,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    tls: AtomicBool,
    socket: std::net::TcpStream,
    guard: CloseGuard,
}

impl ServerConn {
    /// Wraps a freshly dialed stream, returning the stream to drive it with.
    pub fn new(address: impl Into<String>, stream: TcpStream) -> io::Result<(Self, TcpStream)> {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (stream, socket) = with_handle(stream)?;
        let conn = Self {
            id: Uuid::new_v4(),
            address: address.into(),
            local_addr,
            peer_addr,
            tls: AtomicBool::new(false),
            socket,
            guard: CloseGuard::new(),
        };
        Ok((conn, stream))
    }

    /// Whether TLS was negotiated with the upstream.
    pub fn tls(&self) -> bool {
        self.tls.load(Ordering::Acquire)
    }

    pub(crate) fn set_tls(&self, tls: bool) {
        self.tls.store(tls, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.guard.closed.is_cancelled()
    }

    /// Resolves once the transport has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.guard.closed.cancelled()
    }

    fn close_once(&self) -> (bool, CloseResult) {
        self.guard
            .close_once(|| shutdown(&self.socket, Shutdown::Both))
    }
}

impl fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConn")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls())
            .finish()
    }
}

/// State for one accepted client transport.
pub struct ConnContext {
    pub id: Uuid,
    pub client: ClientConn,
    server: Mutex<Option<Arc<ServerConn>>>,
    flow_count: AtomicU64,
    intercept: AtomicBool,
    close_after_response: AtomicBool,
    addons: Addons,
    pub(crate) tunnel: Mutex<Option<JoinHandle<()>>>,
    pub(crate) session: tokio::sync::Mutex<Option<UpstreamSession>>,
}

impl ConnContext {
    /// Wraps an accepted stream and fires `client_connected` before any
    /// byte is read. Returns the stream to serve.
    pub fn accept(
        stream: TcpStream,
        peer_addr: SocketAddr,
        addons: Addons,
    ) -> io::Result<(Arc<Self>, TcpStream)> {
        let (stream, socket) = with_handle(stream)?;
        let client = ClientConn {
            id: Uuid::new_v4(),
            peer_addr,
            tls: AtomicBool::new(false),
            upstream_cert: AtomicBool::new(false),
            socket,
            guard: CloseGuard::new(),
        };

        let ctx = Arc::new(Self {
            id: Uuid::new_v4(),
            client,
            server: Mutex::new(None),
            flow_count: AtomicU64::new(0),
            intercept: AtomicBool::new(false),
            close_after_response: AtomicBool::new(false),
            addons,
            tunnel: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
        });

        ctx.addons.client_connected(&ctx.client);
        Ok((ctx, stream))
    }

    pub fn addons(&self) -> &Addons {
        &self.addons
    }

    /// The current upstream connection, if one was dialed.
    pub fn server(&self) -> Option<Arc<ServerConn>> {
        self.server.lock().clone()
    }

    /// Number of flows started on this connection.
    pub fn flow_count(&self) -> u64 {
        self.flow_count.load(Ordering::Acquire)
    }

    pub(crate) fn next_flow(&self) -> u64 {
        self.flow_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the CONNECT on this connection was chosen for interception.
    pub fn intercept(&self) -> bool {
        self.intercept.load(Ordering::Acquire)
    }

    pub(crate) fn set_intercept(&self, intercept: bool) {
        self.intercept.store(intercept, Ordering::Release);
    }

    /// Whether a message on this connection asked for `Connection: close`.
    pub fn close_after_response(&self) -> bool {
        self.close_after_response.load(Ordering::Acquire)
    }

    pub fn set_close_after_response(&self) {
        self.close_after_response.store(true, Ordering::Release);
    }

    /// Makes `server` the current upstream connection and fires
    /// `server_connected`. A previous connection is closed without touching
    /// the client.
    pub fn attach_server(&self, server: Arc<ServerConn>) {
        let previous = self.server.lock().replace(Arc::clone(&server));
        if let Some(old) = previous {
            if !Arc::ptr_eq(&old, &server) {
                self.supersede(&old);
            }
        }
        self.addons.server_connected(self, &server);
    }

    fn supersede(&self, old: &ServerConn) {
        let (first, _) = old.close_once();
        if first {
            debug!(conn = %self.id, server = %old.address, "superseded upstream connection");
            self.addons.server_disconnected(self, old);
        }
    }

    /// Closes the client transport, fires `client_disconnected`, then
    /// closes the upstream connection.
    pub fn close_client(&self) -> CloseResult {
        let (first, result) = self
            .client
            .guard
            .close_once(|| shutdown(&self.client.socket, Shutdown::Both));
        if first {
            self.addons.client_disconnected(&self.client);
            if let Some(server) = self.server() {
                self.close_server_conn(&server);
            }
        }
        result
    }

    /// Closes the current upstream connection, if any.
    pub fn close_server(&self) -> Option<CloseResult> {
        self.server().map(|server| self.close_server_conn(&server))
    }

    /// Closes `server`, fires `server_disconnected`, then releases the
    /// client: a raw tunnel stops reading so queued bytes still flush, a TLS
    /// connection is force-closed unless the HTTP layer will close it after
    /// the final response.
    pub fn close_server_conn(&self, server: &ServerConn) -> CloseResult {
        let (first, result) = server.close_once();
        if !first {
            return result;
        }

        self.addons.server_disconnected(self, server);

        if !self.client.tls() {
            self.client.close_read();
        } else if !self.close_after_response() {
            self.client.force_close();
        }
        result
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("server", &self.server())
            .field("flow_count", &self.flow_count())
            .field("intercept", &self.intercept())
            .field("close_after_response", &self.close_after_response())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::Addon;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_pending, assert_ready, task};

    #[derive(Default)]
    struct Counter {
        client_connected: AtomicUsize,
        client_disconnected: AtomicUsize,
        server_connected: AtomicUsize,
        server_disconnected: AtomicUsize,
    }

    impl Addon for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn client_connected(&self, _client: &ClientConn) {
            self.client_connected.fetch_add(1, Ordering::SeqCst);
        }
        fn client_disconnected(&self, _client: &ClientConn) {
            self.client_disconnected.fetch_add(1, Ordering::SeqCst);
        }
        fn server_connected(&self, _ctx: &ConnContext, _server: &ServerConn) {
            self.server_connected.fetch_add(1, Ordering::SeqCst);
        }
        fn server_disconnected(&self, _ctx: &ConnContext, _server: &ServerConn) {
            self.server_disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns (accepted side, peer side) of a loopback connection.
    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, peer.unwrap())
    }

    async fn context(counter: &Arc<Counter>) -> (Arc<ConnContext>, TcpStream, TcpStream) {
        let (accepted, client_side) = pair().await;
        let peer = accepted.peer_addr().unwrap();
        let addons = Addons::new(vec![Arc::clone(counter) as Arc<dyn Addon>]);
        let (ctx, stream) = ConnContext::accept(accepted, peer, addons).unwrap();
        (ctx, stream, client_side)
    }

    async fn server_for(ctx: &ConnContext) -> (Arc<ServerConn>, TcpStream, TcpStream) {
        let (dialed, upstream_side) = pair().await;
        let (server, stream) = ServerConn::new("upstream.test:443", dialed).unwrap();
        let server = Arc::new(server);
        ctx.attach_server(Arc::clone(&server));
        (server, stream, upstream_side)
    }

    #[tokio::test]
    async fn accept_fires_client_connected() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;

        assert_eq!(counter.client_connected.load(Ordering::SeqCst), 1);
        assert!(!ctx.client.upstream_cert());
        assert!(!ctx.client.tls());
        assert_eq!(ctx.flow_count(), 0);
    }

    struct Named {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Addon for Named {
        fn name(&self) -> &str {
            self.label
        }
        fn client_connected(&self, _client: &ClientConn) {
            self.log.lock().push(format!("{}:client_connected", self.label));
        }
        fn client_disconnected(&self, _client: &ClientConn) {
            self.log.lock().push(format!("{}:client_disconnected", self.label));
        }
    }

    #[tokio::test]
    async fn connection_hooks_follow_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let addons = Addons::new(vec![
            Arc::new(Named { label: "A", log: Arc::clone(&log) }) as Arc<dyn Addon>,
            Arc::new(Named { label: "B", log: Arc::clone(&log) }),
        ]);
        let (accepted, _client_side) = pair().await;
        let peer = accepted.peer_addr().unwrap();

        let (ctx, _stream) = ConnContext::accept(accepted, peer, addons).unwrap();
        assert_eq!(*log.lock(), vec!["A:client_connected", "B:client_connected"]);

        ctx.close_client();
        assert_eq!(
            *log.lock(),
            vec![
                "A:client_connected",
                "B:client_connected",
                "A:client_disconnected",
                "B:client_disconnected",
            ]
        );
    }

    #[tokio::test]
    async fn upstream_cert_addon_switches_to_eager() {
        let addons = Addons::new(vec![
            Arc::new(crate::addon::UpstreamCertAddon::new(true)) as Arc<dyn Addon>
        ]);
        let (accepted, _client_side) = pair().await;
        let peer = accepted.peer_addr().unwrap();

        let (ctx, _stream) = ConnContext::accept(accepted, peer, addons).unwrap();
        assert!(ctx.client.upstream_cert());
    }

    #[tokio::test]
    async fn client_close_is_idempotent() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;

        let mut closed = task::spawn(ctx.client.closed());
        assert_pending!(closed.poll());

        let first = ctx.close_client();
        assert_ready!(closed.poll());
        let second = ctx.close_client();
        assert_eq!(first, second);
        assert!(ctx.client.is_closed());
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_resolves_when_client_hangs_up() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, peer) = context(&counter).await;

        let waiting = tokio::time::timeout(Duration::from_millis(100), ctx.client.disconnected());
        assert!(waiting.await.is_err());

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), ctx.client.disconnected())
            .await
            .unwrap();
        // Noticing the hangup closes nothing by itself.
        assert!(!ctx.client.is_closed());
    }

    #[tokio::test]
    async fn sending_client_is_not_disconnected() {
        let counter = Arc::new(Counter::default());
        let (ctx, mut stream, mut peer) = context(&counter).await;
        peer.write_all(b"GET").await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(100), ctx.client.disconnected());
        assert!(waiting.await.is_err());

        // The peeked bytes are still there for the real reader.
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");

        ctx.close_client();
        tokio::time::timeout(Duration::from_secs(1), ctx.client.disconnected())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn client_close_cascades_to_server_once() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;
        let (server, _server_stream, _upstream) = server_for(&ctx).await;

        ctx.close_client();
        ctx.close_client();
        ctx.close_server();

        assert!(server.is_closed());
        assert_eq!(counter.server_connected.load(Ordering::SeqCst), 1);
        assert_eq!(counter.server_disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raw_server_close_half_closes_client() {
        let counter = Arc::new(Counter::default());
        let (ctx, mut stream, mut peer) = context(&counter).await;
        let (_server, _server_stream, _upstream) = server_for(&ctx).await;

        ctx.close_server();

        // Reads from the client now see EOF, but writes still reach it.
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        stream.write_all(b"tail").await.unwrap();
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");

        assert!(!ctx.client.is_closed());
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tls_server_close_force_closes_client_without_hooks() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;
        ctx.client.set_tls(true);
        let (_server, _server_stream, _upstream) = server_for(&ctx).await;

        ctx.close_server();

        assert!(ctx.client.is_closed());
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 0);

        // The client's own close routine still runs exactly once later.
        ctx.close_client();
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(counter.server_disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tls_server_close_spares_client_closing_after_response() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;
        ctx.client.set_tls(true);
        ctx.set_close_after_response();
        let (_server, _server_stream, _upstream) = server_for(&ctx).await;

        ctx.close_server();

        assert!(!ctx.client.is_closed());
    }

    #[tokio::test]
    async fn superseding_a_server_leaves_client_open() {
        let counter = Arc::new(Counter::default());
        let (ctx, _stream, _peer) = context(&counter).await;
        let (first, _s1, _u1) = server_for(&ctx).await;
        let (second, _s2, _u2) = server_for(&ctx).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&ctx.server().unwrap(), &second));
        assert!(!ctx.client.is_closed());
        assert_eq!(counter.server_connected.load(Ordering::SeqCst), 2);
        assert_eq!(counter.server_disconnected.load(Ordering::SeqCst), 1);
    }
}
