//! Forward-header rewriter: normalizes the target host:port, honours the
//! `x-proxy-host`/`x-proxy-scheme` override, and detects proxy loops via
//! the `x-proxy-loop` marker header.

use crate::error::ProxyError;
use crate::model::HttpRequestView;

pub const LOOP_HEADER: &str = "x-proxy-loop";
pub const PROXY_HOST_HEADER: &str = "x-proxy-host";
pub const PROXY_SCHEME_HEADER: &str = "x-proxy-scheme";
pub const PROXY_SECRET_HEADER: &str = "x-proxy-secret";

/// The final scheme + authority (host:port, port always present) that a
/// rewritten request should be dialed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub scheme: String,
    pub authority: String,
}

/// Fills in the default port for a scheme if `host` doesn't carry one.
/// Tolerates bracketed IPv6 literals (`[::1]`) — a naive "does the host
/// contain a colon" check would wrongly treat the bracket's internal
/// colons as "already has a port".
pub fn fill_default_port(scheme: &str, host: &str) -> String {
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        "443"
    } else {
        "80"
    };

    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal: "[::1]" or "[::1]:8080".
        return match rest.find(']') {
            Some(end) if rest[end + 1..].starts_with(':') => host.to_string(),
            Some(_) => format!("{host}:{default_port}"),
            None => format!("{host}:{default_port}"),
        };
    }

    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    }
}

/// Rewrites `req` in place: strips hop-by-hop proxy headers, detects
/// loops, applies the `x-proxy-host` override (or falls back to the
/// request's own Host), and inserts the outgoing loop marker.
///
/// Returns the route to dial, or `LoopDetected` if the inbound request
/// already carried the loop marker.
pub fn rewrite(req: &mut HttpRequestView) -> Result<Route, ProxyError> {
    if req.header(LOOP_HEADER).is_some() {
        return Err(ProxyError::LoopDetected);
    }

    req.remove_header("proxy-authorization");
    req.remove_header("proxy-connection");

    let route = if let Some(proxy_host) = req.header(PROXY_HOST_HEADER).map(|s| s.to_string()) {
        let scheme = if req
            .header(PROXY_SCHEME_HEADER)
            .map(|s| s.eq_ignore_ascii_case("http"))
            .unwrap_or(false)
        {
            "http".to_string()
        } else {
            "https".to_string()
        };

        let authority = fill_default_port(&scheme, &proxy_host);
        req.set_header("host", &authority);
        Route { scheme, authority }
    } else {
        let scheme = req.scheme.clone().unwrap_or_else(|| "http".to_string());
        let host = req
            .header("host")
            .map(|s| s.to_string())
            .unwrap_or_default();
        let authority = fill_default_port(&scheme, &host);
        req.set_header("host", &authority);
        Route { scheme, authority }
    };

    req.remove_header(PROXY_HOST_HEADER);
    req.remove_header(PROXY_SCHEME_HEADER);
    req.remove_header(PROXY_SECRET_HEADER);
    req.set_header(LOOP_HEADER, "1");

    Ok(route)
}
