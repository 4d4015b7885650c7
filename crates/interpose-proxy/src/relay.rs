//! Byte relays: bidirectional copy for raw tunnels, raw HTTP forwarding for
//! traffic that is not intercepted, and upgraded (WebSocket) connections.

use std::io;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::body::{self, ProxyBody};
use crate::connection::ConnContext;
use crate::error::{is_benign_io, ProxyError, Result};
use crate::host_port::target_addr;
use crate::upstream::{BoxedIo, Dialer, Io};

/// Copies bytes both ways between `client` and `server` until either side
/// ends.
///
/// Server-to-client runs on a spawned task which closes the server
/// connection when it ends; client-to-server runs here and closes the
/// client (and with it the server) when it ends.
pub async fn transfer<C: Io, S: Io>(ctx: &Arc<ConnContext>, client: C, server: S) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let downstream_ctx = Arc::clone(ctx);
    let downstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut server_read, &mut client_write).await;
        log_copy("server -> client", copied);
        let _ = client_write.shutdown().await;
        downstream_ctx.close_server();
    });

    let copied = tokio::io::copy(&mut client_read, &mut server_write).await;
    log_copy("client -> server", copied);
    let _ = server_write.shutdown().await;
    ctx.close_client();

    let _ = downstream.await;
}

fn log_copy(direction: &str, copied: io::Result<u64>) {
    match copied {
        Ok(bytes) => debug!(direction, bytes, "relay finished"),
        Err(e) if is_benign_io(&e) => debug!(direction, "relay ended: {e}"),
        Err(e) => warn!(direction, "relay failed: {e}"),
    }
}

/// Logs a per-connection error at a level matching how expected it is.
pub fn log_error(context: &str, err: &ProxyError) {
    if err.is_benign() {
        debug!("{context}: {err}");
    } else {
        warn!("{context}: {err}");
    }
}

/// Whether the request asks to switch protocols.
pub fn is_upgrade<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(UPGRADE)
        && req
            .headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v: &HeaderValue| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Sends `req` over a fresh client connection on `io` and returns the
/// response. When both sides switch protocols, the upgraded streams are
/// joined by a raw byte copy.
pub async fn send_upgradable(
    io: BoxedIo,
    req: Request<ProxyBody>,
    client_upgrade: Option<OnUpgrade>,
) -> Result<Response<ProxyBody>> {
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake::<_, ProxyBody>(TokioIo::new(io))
        .await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("forward connection ended: {e}");
        }
    });

    let mut res = sender.send_request(req).await?;

    if res.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let server_upgrade = hyper::upgrade::on(&mut res);
            tokio::spawn(relay_upgraded(client_upgrade, server_upgrade));
        }
    }

    Ok(res.map(body::incoming))
}

async fn relay_upgraded(client: OnUpgrade, server: OnUpgrade) {
    let (client, server) = match tokio::try_join!(client, server) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("upgrade failed: {e}");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut server = TokioIo::new(server);
    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((up, down)) => debug!(up, down, "upgraded relay finished"),
        Err(e) if is_benign_io(&e) => debug!("upgraded relay ended: {e}"),
        Err(e) => warn!("upgraded relay failed: {e}"),
    }
}

/// Forwards a request that is not intercepted: dials the `Host` directly
/// (default port 80) and relays the response unmodified. No hooks run.
pub async fn forward_http(
    dialer: &Dialer,
    ctx: &ConnContext,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let (address, _) = target_addr(&host, "80");

    let tcp = match dialer.connect_direct(ctx, &address).await {
        Ok(tcp) => tcp,
        Err(e) => {
            log_error("forward", &e);
            return body::response(StatusCode::BAD_GATEWAY, "");
        }
    };

    let client_upgrade = is_upgrade(&req).then(|| hyper::upgrade::on(&mut req));
    req.headers_mut().remove("proxy-connection");
    *req.uri_mut() = origin_form(req.uri());

    match send_upgradable(Box::new(tcp), req.map(body::incoming), client_upgrade).await {
        Ok(res) => res,
        Err(e) => {
            log_error("forward", &e);
            body::response(StatusCode::BAD_GATEWAY, "")
        }
    }
}

/// Strips scheme and authority, keeping path and query.
pub fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .map(|pq| Uri::from(pq.clone()))
        .unwrap_or_else(|| Uri::from_static("/"))
}
