//! Per-connection error kinds. The dispatcher matches on these to decide
//! what, if anything, to write back to the client before closing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed protocol framing: {0}")]
    Parse(String),

    #[error("proxy authentication required")]
    AuthRequired,

    #[error("proxy authentication failed")]
    AuthFailed,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(#[source] std::io::Error),

    #[error("proxy loop detected")]
    LoopDetected,

    #[error("tunnel i/o error: {0}")]
    TunnelIo(#[source] std::io::Error),
}

impl ProxyError {
    /// Short tag used in log lines; keeps log output grep-able by stage.
    pub fn stage(&self) -> &'static str {
        match self {
            ProxyError::Parse(_) => "parse",
            ProxyError::AuthRequired => "auth-required",
            ProxyError::AuthFailed => "auth-failed",
            ProxyError::UpstreamUnreachable(_) => "upstream-unreachable",
            ProxyError::LoopDetected => "loop-detected",
            ProxyError::TunnelIo(_) => "tunnel-io",
        }
    }
}
