//! SOCKS5 state machine: greeting/method-select, RFC 1929 user/password
//! sub-negotiation, CONNECT request parsing, and the success reply.
//!
//! States: `AwaitGreeting -> SelectMethod -> [AuthSubNegotiation] ->
//! AwaitRequest -> ReplyAndTunnel -> Terminal`. The success reply echoes
//! back the exact ATYP/address/port bytes read off the wire rather than
//! reconstructing them, so it's a byte-exact round trip of whatever the
//! client sent.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::ProxyError;
use crate::model::{Credential, TargetAddr, TargetAddrKind};
use crate::tunnel::{self, Connection};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Runs the full SOCKS5 handshake on `client` and, on success, tunnels to
/// the requested target. Terminates without any SOCKS failure reply on
/// parse errors or unsupported requests — just closes the connection.
pub async fn handle(
    mut client: impl Connection + 'static,
    credential: Option<Credential>,
) -> Result<(), ProxyError> {
    greeting_and_method_select(&mut client, credential.as_ref())
        .await
        .map_err(|e| ProxyError::Parse(e.to_string()))?;

    if let Some(cred) = &credential {
        sub_negotiate(&mut client, cred).await?;
    }

    let target = receive_target_address(&mut client)
        .await
        .map_err(|e| ProxyError::Parse(e.to_string()))?;

    let dial_target = target.dial_string();
    let upstream = match TcpStream::connect(&dial_target).await {
        Ok(s) => s,
        Err(e) => {
            // Reply is written before dial, so a dial failure here leaves
            // the client believing the tunnel already opened.
            warn!(target = %dial_target, error = %e, "socks5 upstream dial failed after success reply already written");
            return Err(ProxyError::UpstreamUnreachable(e));
        }
    };

    tunnel::splice(client, upstream)
        .await
        .map_err(|e| ProxyError::TunnelIo(std::io::Error::other(e.to_string())))
}

async fn greeting_and_method_select(
    client: &mut (impl Connection + Unpin),
    credential: Option<&Credential>,
) -> Result<()> {
    let mut ver = [0u8; 1];
    client.read_exact(&mut ver).await?;
    if ver[0] != VERSION {
        anyhow::bail!("unsupported socks version {:#x}", ver[0]);
    }

    let mut nmethods = [0u8; 1];
    client.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    client.read_exact(&mut methods).await?;

    if let Some(_cred) = credential {
        if !methods.contains(&METHOD_USER_PASS) {
            client.write_all(&[VERSION, 0xFF]).await?;
            anyhow::bail!("client did not offer username/password auth method");
        }
        client.write_all(&[VERSION, METHOD_USER_PASS]).await?;
    } else {
        client.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
    }
    Ok(())
}

async fn sub_negotiate(
    client: &mut (impl Connection + Unpin),
    credential: &Credential,
) -> Result<(), ProxyError> {
    let read = async {
        let mut ver = [0u8; 1];
        client.read_exact(&mut ver).await?;
        if ver[0] != 0x01 {
            anyhow::bail!("unsupported auth sub-negotiation version {:#x}", ver[0]);
        }

        let mut ulen = [0u8; 1];
        client.read_exact(&mut ulen).await?;
        let mut user = vec![0u8; ulen[0] as usize];
        client.read_exact(&mut user).await?;

        let mut plen = [0u8; 1];
        client.read_exact(&mut plen).await?;
        let mut pass = vec![0u8; plen[0] as usize];
        client.read_exact(&mut pass).await?;

        Ok::<_, anyhow::Error>((
            String::from_utf8_lossy(&user).into_owned(),
            String::from_utf8_lossy(&pass).into_owned(),
        ))
    }
    .await
    .map_err(|e| ProxyError::Parse(e.to_string()))?;

    let (username, password) = read;
    if credential.matches(&username, &password) {
        client
            .write_all(&[0x01, 0x00])
            .await
            .map_err(|e| ProxyError::TunnelIo(e))?;
        Ok(())
    } else {
        let _ = client.write_all(&[0x01, 0x01]).await;
        Err(ProxyError::AuthFailed)
    }
}

async fn receive_target_address(client: &mut (impl Connection + Unpin)) -> Result<TargetAddr> {
    let mut header = [0u8; 3];
    client.read_exact(&mut header).await?;
    if header[0] != VERSION {
        anyhow::bail!("unknown socks version in request: {:#x}", header[0]);
    }
    if header[1] != CMD_CONNECT {
        anyhow::bail!("unsupported socks command {:#x} (only CONNECT is supported)", header[1]);
    }
    if header[2] != 0x00 {
        anyhow::bail!("unknown socks rsv byte {:#x}", header[2]);
    }

    let mut atyp = [0u8; 1];
    client.read_exact(&mut atyp).await?;

    let mut raw_addr = Vec::new();
    let kind = match atyp[0] {
        ATYP_V4 => {
            let mut b = [0u8; 4];
            client.read_exact(&mut b).await?;
            raw_addr.extend_from_slice(&b);
            TargetAddrKind::V4(Ipv4Addr::from(b))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            raw_addr.push(len[0]);
            raw_addr.extend_from_slice(&name);
            TargetAddrKind::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        ATYP_V6 => {
            let mut b = [0u8; 16];
            client.read_exact(&mut b).await?;
            raw_addr.extend_from_slice(&b);
            TargetAddrKind::V6(Ipv6Addr::from(b))
        }
        other => anyhow::bail!("unsupported socks address type {:#x}", other),
    };

    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    let target = TargetAddr {
        kind,
        port,
        atyp: atyp[0],
        raw_addr: raw_addr.clone(),
    };

    // Echo exactly what was read: VER=0x00(success) RSV=0x00 ATYP addr port.
    let mut reply = vec![VERSION, 0x00, 0x00, atyp[0]];
    reply.extend_from_slice(&raw_addr);
    reply.extend_from_slice(&port_bytes);
    client.write_all(&reply).await?;

    Ok(target)
}
