//! HTTP proxy state machine: request parsing, Basic-auth challenge,
//! CONNECT-vs-forward dispatch, and the handoff into the tunnel.
//!
//! States: `ReadRequest -> [AuthCheck] -> Rewrite -> Dispatch({Connect,
//! Forward}) -> Tunnel -> Terminal`. Request-line/header parsing uses
//! `httparse` for the initial pass.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::auth;
use crate::error::ProxyError;
use crate::model::{Credential, HttpRequestView};
use crate::rewrite::{self, Route, PROXY_HOST_HEADER, PROXY_SECRET_HEADER};
use crate::tunnel::{self, Connection};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the HTTP proxy state machine on `client`. `client_tls` is the
/// rustls client config used to dial `https://` forward (non-CONNECT)
/// targets.
pub async fn handle(
    mut client: impl Connection + 'static,
    credential: Option<Credential>,
    client_tls: Arc<rustls::ClientConfig>,
) -> Result<(), ProxyError> {
    let (mut req, leftover_body) = read_request(&mut client)
        .await
        .map_err(|e| ProxyError::Parse(e.to_string()))?;

    if let Err(e) = auth_check(&req, credential.as_ref()).await {
        return handle_auth_failure(&mut client, &e).await;
    }

    let route = rewrite::rewrite(&mut req)?;

    if req.is_connect() {
        dispatch_connect(client, &req, &route).await
    } else {
        dispatch_forward(client, &req, &route, leftover_body, client_tls).await
    }
}

async fn handle_auth_failure(
    client: &mut (impl Connection + Unpin),
    err: &ProxyError,
) -> Result<(), ProxyError> {
    if matches!(err, ProxyError::AuthRequired) {
        let body = b"";
        let resp = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        let _ = client.write_all(resp.as_bytes()).await;
    }
    // auth-failed: no reply, just close.
    match err {
        ProxyError::AuthRequired => Err(ProxyError::AuthRequired),
        ProxyError::AuthFailed => Err(ProxyError::AuthFailed),
        _ => unreachable!("auth_check only returns AuthRequired/AuthFailed/Ok"),
    }
}

/// Returns `Ok(())` if auth passes (or isn't required), else the
/// `AuthRequired`/`AuthFailed` error kind to act on.
async fn auth_check(req: &HttpRequestView, credential: Option<&Credential>) -> Result<(), ProxyError> {
    let Some(cred) = credential else {
        return Ok(());
    };

    // When both a credential is configured and x-proxy-host is present,
    // require x-proxy-secret == password instead of stacking it on top of
    // Basic auth. Missing x-proxy-secret in that case fails closed rather
    // than falling back to Basic-only.
    if req.header(PROXY_HOST_HEADER).is_some() {
        return match req.header(PROXY_SECRET_HEADER) {
            Some(secret) if secret == cred.password => Ok(()),
            _ => Err(ProxyError::AuthFailed),
        };
    }

    let Some(header) = req.header("proxy-authorization") else {
        return Err(ProxyError::AuthRequired);
    };
    let Some((user, pass)) = auth::parse_basic_auth(header) else {
        return Err(ProxyError::AuthFailed);
    };
    if auth::check_credential(cred, &user, &pass) {
        Ok(())
    } else {
        Err(ProxyError::AuthFailed)
    }
}

async fn dispatch_connect(
    mut client: impl Connection + 'static,
    req: &HttpRequestView,
    route: &Route,
) -> Result<(), ProxyError> {
    let upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&route.authority)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return connect_dial_failed(&mut client, e).await,
        Err(_) => {
            return connect_dial_failed(
                &mut client,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            )
            .await
        }
    };

    let status_line = format!(
        "HTTP/{}.{} 200 Connection established\r\n\r\n",
        req.version_major, req.version_minor
    );
    client
        .write_all(status_line.as_bytes())
        .await
        .map_err(ProxyError::TunnelIo)?;

    info!(authority = %route.authority, "CONNECT tunnel established");
    tunnel::splice(client, upstream)
        .await
        .map_err(|e| ProxyError::TunnelIo(std::io::Error::other(e.to_string())))
}

async fn connect_dial_failed(
    client: &mut (impl Connection + Unpin),
    err: std::io::Error,
) -> Result<(), ProxyError> {
    let msg = format!("CONNECT failed: {err}\n");
    let resp = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\n\r\n{}",
        msg.len(),
        msg
    );
    let _ = client.write_all(resp.as_bytes()).await;
    Err(ProxyError::UpstreamUnreachable(err))
}

async fn dispatch_forward(
    mut client: impl Connection + 'static,
    req: &HttpRequestView,
    route: &Route,
    leftover_body: Vec<u8>,
    client_tls: Arc<rustls::ClientConfig>,
) -> Result<(), ProxyError> {
    let tcp = match timeout(DIAL_TIMEOUT, TcpStream::connect(&route.authority)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return forward_dial_failed(&mut client, e).await,
        Err(_) => {
            return forward_dial_failed(
                &mut client,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            )
            .await
        }
    };

    let wire = serialize_request(req);

    if route.scheme.eq_ignore_ascii_case("https") {
        let host = route
            .authority
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| route.authority.clone());
        let server_name = match ServerName::try_from(host) {
            Ok(n) => n,
            Err(_) => {
                return forward_dial_failed(
                    &mut client,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid server name"),
                )
                .await
            }
        };
        let connector = tokio_rustls::TlsConnector::from(client_tls);
        let mut upstream = match timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return forward_dial_failed(&mut client, std::io::Error::other(e.to_string())).await
            }
            Err(_) => {
                return forward_dial_failed(
                    &mut client,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out"),
                )
                .await
            }
        };
        upstream
            .write_all(&wire)
            .await
            .map_err(ProxyError::TunnelIo)?;
        if !leftover_body.is_empty() {
            upstream
                .write_all(&leftover_body)
                .await
                .map_err(ProxyError::TunnelIo)?;
        }
        tunnel::splice(client, upstream)
            .await
            .map_err(|e| ProxyError::TunnelIo(std::io::Error::other(e.to_string())))
    } else {
        let mut upstream = tcp;
        upstream
            .write_all(&wire)
            .await
            .map_err(ProxyError::TunnelIo)?;
        if !leftover_body.is_empty() {
            upstream
                .write_all(&leftover_body)
                .await
                .map_err(ProxyError::TunnelIo)?;
        }
        tunnel::splice(client, upstream)
            .await
            .map_err(|e| ProxyError::TunnelIo(std::io::Error::other(e.to_string())))
    }
}

async fn forward_dial_failed(
    client: &mut (impl Connection + Unpin),
    err: std::io::Error,
) -> Result<(), ProxyError> {
    let msg = format!("Bad Gateway: {err}\n");
    let resp = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: {}\r\n\r\n{}",
        msg.len(),
        msg
    );
    let _ = client.write_all(resp.as_bytes()).await;
    Err(ProxyError::UpstreamUnreachable(err))
}

/// Serializes the rewritten request back to wire bytes: request-line (with
/// the original path preserved, proxy-loop-safe, origin-form) + headers +
/// blank line. Hop-by-hop proxy headers and the override headers were
/// already stripped by `rewrite::rewrite`.
fn serialize_request(req: &HttpRequestView) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(req.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request_path(req).as_bytes());
    out.push(b' ');
    out.extend_from_slice(format!("HTTP/{}.{}", req.version_major, req.version_minor).as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Strips a `scheme://authority` prefix from an absolute-form target,
/// leaving just the path+query (origin-form) to send upstream.
fn request_path(req: &HttpRequestView) -> String {
    if let Some(rest) = req
        .target
        .strip_prefix("http://")
        .or_else(|| req.target.strip_prefix("https://"))
    {
        match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        }
    } else {
        req.target.clone()
    }
}

/// Parses an HTTP/1.x request line + headers off `client`, growing the
/// read buffer until `httparse` succeeds or `MAX_HEADER_BYTES` is
/// exceeded. Returns the owned request view plus any body bytes that were
/// read past the header terminator in the same read call (common when a
/// CONNECT request and the client's immediately-following TLS ClientHello
/// land in the same TCP segment).
async fn read_request(
    client: &mut (impl Connection + Unpin),
) -> anyhow::Result<(HttpRequestView, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed before a full request was received");
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            anyhow::bail!("request headers exceeded {MAX_HEADER_BYTES} bytes");
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf)? {
            httparse::Status::Complete(consumed) => {
                let method = parsed
                    .method
                    .ok_or_else(|| anyhow::anyhow!("missing method"))?
                    .to_string();
                let path = parsed
                    .path
                    .ok_or_else(|| anyhow::anyhow!("missing request target"))?
                    .to_string();
                let minor = parsed.version.unwrap_or(1);

                let mut view = HttpRequestView::new(method, path, 1, minor);
                for h in parsed.headers.iter() {
                    let value = std::str::from_utf8(h.value)?;
                    view.set_header(h.name, value);
                }

                let leftover = buf[consumed..].to_vec();
                return Ok((view, leftover));
            }
            httparse::Status::Partial => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn no_tls_client_config() -> Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// HTTP CONNECT with no auth configured tunnels after a 200 reply.
    #[tokio::test]
    async fn connect_tunnels_after_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (mut test_client, proxy_side) = duplex(1024);
        let handle = tokio::spawn(handle(proxy_side, None, no_tls_client_config()));

        let req = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
        test_client.write_all(req.as_bytes()).await.unwrap();

        let mut resp = vec![0u8; "HTTP/1.1 200 Connection established\r\n\r\n".len()];
        test_client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, b"HTTP/1.1 200 Connection established\r\n\r\n");

        drop(test_client);
        let _ = handle.await;
    }

    /// GET with an x-proxy-host/x-proxy-scheme override routes to the
    /// overridden host:port, and the upstream request carries the loop
    /// marker.
    #[tokio::test]
    async fn proxy_host_override_routes_and_tags_loop_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            buf.truncate(n);
            String::from_utf8(buf).unwrap()
        });

        let (mut test_client, proxy_side) = duplex(4096);
        let handle = tokio::spawn(handle(proxy_side, None, no_tls_client_config()));

        let req = format!(
            "GET / HTTP/1.1\r\nHost: ignore.me\r\nx-proxy-host: 127.0.0.1:{}\r\nx-proxy-scheme: http\r\n\r\n",
            addr.port()
        );
        test_client.write_all(req.as_bytes()).await.unwrap();

        let upstream_request = server.await.unwrap();
        assert!(upstream_request.contains("x-proxy-loop: 1"));
        assert!(upstream_request.to_lowercase().contains(&format!("host: 127.0.0.1:{}", addr.port())));

        drop(test_client);
        let _ = handle.await;
    }

    /// Missing Proxy-Authorization yields exactly one 407 response.
    #[tokio::test]
    async fn auth_required_sends_407() {
        let credential = Credential {
            username: "u".into(),
            password: "p".into(),
        };
        let (mut test_client, proxy_side) = duplex(1024);
        let handle = tokio::spawn(handle(proxy_side, Some(credential), no_tls_client_config()));

        let req = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        test_client.write_all(req.as_bytes()).await.unwrap();

        let mut resp = vec![0u8; 4096];
        let n = test_client.read(&mut resp).await.unwrap();
        resp.truncate(n);
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(text.contains("Proxy-Authenticate: Basic realm=\"Proxy\""));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::AuthRequired)));
    }

    /// x-proxy-loop: 1 on an inbound request yields loop-detected with no
    /// upstream connection attempt.
    #[tokio::test]
    async fn loop_marker_rejected_before_dial() {
        let (mut test_client, proxy_side) = duplex(1024);
        let handle = tokio::spawn(handle(proxy_side, None, no_tls_client_config()));

        let req = "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nx-proxy-loop: 1\r\n\r\n";
        test_client.write_all(req.as_bytes()).await.unwrap();
        drop(test_client);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::LoopDetected)));
    }
}
