//! Host:port splitting and joining.
//!
//! Unlike `SocketAddr` parsing these work on unresolved names, keep zone
//! identifiers in IPv6 literals, and follow RFC 3986 in requiring a port to
//! be numeric: anything after the last colon that is not all digits is part
//! of the host.

use hyper::Uri;

/// Separates `host` and `port`.
///
/// When the text after the last colon is not a valid (possibly empty)
/// numeric port, the whole input is returned as the host. Surrounding
/// brackets are removed from the host.
pub fn split_host_port(host_port: &str) -> (&str, &str) {
    let mut host = host_port;
    let mut port = "";

    if let Some(colon) = host.rfind(':') {
        if valid_optional_port(&host[colon..]) {
            port = &host[colon + 1..];
            host = &host[..colon];
        }
    }

    if host.len() >= 2 && host.starts_with('[') && host.ends_with(']') {
        host = &host[1..host.len() - 1];
    }

    (host, port)
}

/// Combines `host` and `port` into an address. Hosts containing a colon
/// (IPv6 literals) are bracketed. An empty port yields just the host.
pub fn join_host_port(host: &str, port: &str) -> String {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    if port.is_empty() {
        host
    } else {
        format!("{host}:{port}")
    }
}

/// Returns `host:port` for a URI, filling in the scheme's default port.
pub fn canonical_addr(uri: &Uri) -> String {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let authority = strip_userinfo(authority);
    let (host, port) = split_host_port(authority);

    let port = match port {
        "" => default_port(uri.scheme_str()),
        port => port,
    };

    join_host_port(host, port)
}

/// Resolves a `Host` header value (or authority) to a dialable address,
/// using `default_port` when none is given.
pub fn target_addr(host_header: &str, default_port: &str) -> (String, String) {
    let (host, port) = split_host_port(strip_userinfo(host_header));
    let port = if port.is_empty() { default_port } else { port };
    (join_host_port(host, port), host.to_string())
}

fn default_port(scheme: Option<&str>) -> &'static str {
    match scheme {
        Some(s) if s.eq_ignore_ascii_case("https") || s.eq_ignore_ascii_case("wss") => "443",
        _ => "80",
    }
}

fn strip_userinfo(authority: &str) -> &str {
    authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority)
}

/// Reports whether `port` is empty or matches `:[0-9]*`.
fn valid_optional_port(port: &str) -> bool {
    if port.is_empty() {
        return true;
    }
    match port.strip_prefix(':') {
        Some(digits) => digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
