//! Credential check primitives: Basic auth header decoding and comparison
//! against the configured username/password.

use base64::Engine;

use crate::model::Credential;

/// Parses `Basic <base64(user:pass)>`, case-insensitive on the `Basic`
/// prefix.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    const PREFIX: &str = "Basic ";
    let prefix = header.get(..PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&header[PREFIX.len()..])
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Plain byte comparison against the configured credential — no
/// constant-time hardening.
pub fn check_credential(cred: &Credential, username: &str, password: &str) -> bool {
    cred.matches(username, password)
}
