//! Accept loop + protocol dispatcher: binds the listener, spawns a task
//! per connection, peeks the first bytes, and routes to the matching
//! protocol handler. Never lets one bad connection kill the listener.
//!
//! Classification: peek 3 bytes; `0x05` means SOCKS5, `0x16` means a TLS
//! handshake (terminated and re-dispatched as HTTP if a server
//! certificate is configured, otherwise passed through via SNI), anything
//! else is treated as HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::http_proxy;
use crate::peekable::PeekableStream;
use crate::sni;
use crate::socks5;
use crate::tls;

const PEEK_LEN: usize = 3;

#[derive(Clone)]
pub struct Dispatcher {
    cfg: Arc<Config>,
    server_tls: Option<Arc<rustls::ServerConfig>>,
    client_tls: Arc<rustls::ClientConfig>,
}

impl Dispatcher {
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        let server_tls = cfg
            .cert_bundle
            .as_ref()
            .map(tls::build_server_config)
            .transpose()?
            .map(Arc::new);
        let client_tls = Arc::new(tls::build_client_config());

        Ok(Self {
            cfg: Arc::new(cfg),
            server_tls,
            client_tls,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(listen = %self.cfg.listen_addr, "starting proxy");

        tokio::select! {
            res = self.accept_loop() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, closing proxy");
                Ok(())
            }
        }
    }

    async fn accept_loop(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen_addr).await?;
        info!(addr = %self.cfg.listen_addr, "listening");

        loop {
            let (sock, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_connection(sock, peer_addr).await {
                    error!(peer = %peer_addr, stage = e.stage(), error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, sock: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let mut peeked = PeekableStream::new(sock);
        let mut head = [0u8; PEEK_LEN];
        tokio::io::AsyncReadExt::read_exact(&mut peeked, &mut head)
            .await
            .map_err(|e| ProxyError::Parse(e.to_string()))?;
        peeked.stop_recording();

        info!(peer = %peer, first_byte = format!("{:#x}", head[0]), "dispatching connection");

        match head[0] {
            0x05 => socks5::handle(peeked, self.cfg.credential.clone()).await,
            0x16 => {
                if let Some(server_tls) = &self.server_tls {
                    let acceptor = TlsAcceptor::from(server_tls.clone());
                    let terminated = acceptor
                        .accept(peeked)
                        .await
                        .map_err(|e| ProxyError::Parse(format!("tls handshake failed: {e}")))?;
                    http_proxy::handle(terminated, self.cfg.credential.clone(), self.client_tls.clone()).await
                } else {
                    sni::handle(peeked).await
                }
            }
            _ => http_proxy::handle(peeked, self.cfg.credential.clone(), self.client_tls.clone()).await,
        }
    }
}
