//! Shared value types. Created per-connection, dropped with it; the only
//! thing that outlives a connection is the immutable configuration.

use std::net::{Ipv4Addr, Ipv6Addr};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Username/password pair gating SOCKS5 and HTTP proxy auth. Absent means
/// authentication is disabled for both protocols.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Certificate chain + private key used only by C6 (server-side TLS
/// termination against the client). `PrivateKeyDer` doesn't implement
/// `Clone` (use `.key.clone_key()` where an owned copy is needed), so
/// this type isn't `Clone` either.
#[derive(Debug)]
pub struct CertBundle {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// SOCKS5 address kinds (RFC 1928 ATYP), tagged the way the wire encodes
/// them: IPv4, a domain name to be resolved downstream, or IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddrKind {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

/// A parsed SOCKS5 CONNECT target: address + port, plus the raw ATYP/addr
/// bytes as read off the wire (needed to echo an exact reply).
#[derive(Debug, Clone)]
pub struct TargetAddr {
    pub kind: TargetAddrKind,
    pub port: u16,
    pub atyp: u8,
    pub raw_addr: Vec<u8>,
}

impl TargetAddr {
    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn dial_string(&self) -> String {
        match &self.kind {
            TargetAddrKind::V4(ip) => format!("{ip}:{}", self.port),
            TargetAddrKind::V6(ip) => format!("[{ip}]:{}", self.port),
            TargetAddrKind::Domain(name) => format!("{name}:{}", self.port),
        }
    }
}

/// Owned view of a parsed HTTP/1.x request. `httparse` borrows into the
/// input buffer, but C9 needs to rewrite `Host` and strip headers after
/// parsing — so this is the mutable, owned record built on top of the
/// initial `httparse` pass. Header names are stored lower-cased for
/// case-insensitive lookup/removal.
#[derive(Debug, Clone)]
pub struct HttpRequestView {
    pub method: String,
    pub target: String,
    pub version_major: u8,
    pub version_minor: u8,
    pub scheme: Option<String>,
    headers: Vec<(String, String)>,
    pub body_prefix: Vec<u8>,
}

impl HttpRequestView {
    pub fn new(method: String, target: String, version_major: u8, version_minor: u8) -> Self {
        let scheme = if target.starts_with("https://") {
            Some("https".to_string())
        } else if target.starts_with("http://") {
            Some("http".to_string())
        } else {
            None
        };
        Self {
            method,
            target,
            version_major,
            version_minor,
            scheme,
            headers: Vec::new(),
            body_prefix: Vec::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        if let Some(entry) = self.headers.iter_mut().find(|(k, _)| *k == lower) {
            entry.1 = value.to_string();
        } else {
            self.headers.push((lower, value.to_string()));
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}
