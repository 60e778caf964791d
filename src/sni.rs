//! TLS ClientHello / SNI sniffing, with no decryption: read the client's
//! handshake record, extract the Server Name Indication, and pass the raw
//! bytes through to the real origin.
//!
//! Reads a 5-byte record header, validates it, then reads the rest of the
//! record under a timeout. The ClientHello field walk uses a
//! bounds-checked cursor so every step fails closed on truncated input
//! instead of panicking on an out-of-range index.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::error::ProxyError;
use crate::tunnel::{self, Connection};

const TLS_RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16 * 1024;
const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads the client's TLS record containing the ClientHello, extracts SNI,
/// dials `sni:443`, replays the captured record to the upstream, then
/// tunnels. `client` must already have recorded (and still hold buffered)
/// the bytes the dispatcher peeked to classify the connection as TLS — the
/// caller is expected to pass a `PeekableStream` still in replay mode so
/// those bytes aren't lost.
pub async fn handle(mut client: impl Connection + 'static) -> Result<(), ProxyError> {
    let record = timeout(CLIENT_HELLO_TIMEOUT, read_client_hello_record(&mut client))
        .await
        .map_err(|_| ProxyError::Parse("timed out waiting for ClientHello".into()))?
        .map_err(|e| ProxyError::Parse(e.to_string()))?;

    let sni = extract_sni(&record).ok_or_else(|| ProxyError::Parse("no SNI extension in ClientHello".into()))?;

    let dial_target = format!("{sni}:443");
    let mut upstream = TcpStream::connect(&dial_target)
        .await
        .map_err(ProxyError::UpstreamUnreachable)?;

    upstream
        .write_all(&record)
        .await
        .map_err(ProxyError::TunnelIo)?;

    info!(sni, "TLS SNI passthrough tunnel established");
    tunnel::splice(client, upstream)
        .await
        .map_err(|e| ProxyError::TunnelIo(std::io::Error::other(e.to_string())))
}

async fn read_client_hello_record(
    client: &mut (impl Connection + Unpin),
) -> std::io::Result<Vec<u8>> {
    let mut record = vec![0u8; TLS_RECORD_HEADER_LEN];
    client.read_exact(&mut record).await?;

    if record[0] != 0x16 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not a TLS handshake record",
        ));
    }

    let body_len = ((record[3] as usize) << 8) | (record[4] as usize);
    if !(4..=MAX_RECORD_LEN).contains(&body_len) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid TLS record length",
        ));
    }

    let mut body = vec![0u8; body_len];
    client.read_exact(&mut body).await?;
    record.extend_from_slice(&body);
    Ok(record)
}

/// Walks the ClientHello's fixed fields then its extensions list, bailing
/// with `None` the moment a declared length would run past the buffer.
fn extract_sni(buf: &[u8]) -> Option<String> {
    if buf.len() < TLS_RECORD_HEADER_LEN || buf[0] != 0x16 {
        return None;
    }

    let mut pos = TLS_RECORD_HEADER_LEN;
    pos = pos.checked_add(4)?; // handshake type (1) + length (3)
    pos = pos.checked_add(2)?; // client version
    pos = pos.checked_add(32)?; // client random
    if pos >= buf.len() {
        return None;
    }

    let session_id_len = buf[pos] as usize;
    pos += 1;
    pos = pos.checked_add(session_id_len)?;
    if pos + 2 > buf.len() {
        return None;
    }

    let cipher_suites_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    pos = pos.checked_add(cipher_suites_len)?;
    if pos >= buf.len() {
        return None;
    }

    let compression_len = buf[pos] as usize;
    pos += 1;
    pos = pos.checked_add(compression_len)?;
    if pos + 2 > buf.len() {
        return None;
    }

    let extensions_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    let extensions_end = pos.checked_add(extensions_len)?;
    if extensions_end > buf.len() {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = ((buf[pos] as u16) << 8) | (buf[pos + 1] as u16);
        let ext_len = ((buf[pos + 2] as usize) << 8) | (buf[pos + 3] as usize);
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }

        if ext_type == 0x0000 {
            return parse_sni_extension(&buf[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

fn parse_sni_extension(ext: &[u8]) -> Option<String> {
    if ext.len() < 2 {
        return None;
    }
    let list_len = ((ext[0] as usize) << 8) | (ext[1] as usize);
    let list = ext.get(2..2 + list_len)?;
    if list.len() < 3 || list[0] != 0x00 {
        return None; // name type 0x00 == host_name
    }
    let name_len = ((list[1] as usize) << 8) | (list[2] as usize);
    let name = list.get(3..3 + name_len)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal (unencrypted framing only, no real crypto) TLS
    /// record containing a ClientHello with a single SNI extension, the
    /// way a real client would frame one.
    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let mut sni_name = vec![0x00]; // name type: host_name
        sni_name.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        sni_name.extend_from_slice(hostname.as_bytes());

        let mut server_name_list = (sni_name.len() as u16).to_be_bytes().to_vec();
        server_name_list.extend_from_slice(&sni_name);

        let mut sni_ext = vec![0x00, 0x00]; // extension type: server_name
        sni_ext.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&server_name_list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&sni_ext);

        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]); // client version
        hello_body.extend_from_slice(&[0u8; 32]); // random
        hello_body.push(0x00); // session id len
        hello_body.extend_from_slice(&[0x00, 0x02]); // cipher suites len
        hello_body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        hello_body.push(0x01); // compression methods len
        hello_body.push(0x00); // compression method: null
        hello_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello_body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01]; // handshake type: client_hello
        let len = hello_body.len() as u32;
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&hello_body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// SNI correctly extracted from a well-formed ClientHello.
    #[test]
    fn extracts_sni_from_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record).as_deref(), Some("example.com"));
    }

    #[test]
    fn rejects_non_tls_record() {
        let buf = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        assert_eq!(extract_sni(&buf), None);
    }

    #[test]
    fn truncated_record_fails_closed() {
        let mut record = client_hello_with_sni("example.com");
        record.truncate(record.len() - 5);
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn client_hello_without_sni_extension_yields_none() {
        // No extensions at all: extensions_len = 0.
        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]);
        hello_body.extend_from_slice(&[0u8; 32]);
        hello_body.push(0x00);
        hello_body.extend_from_slice(&[0x00, 0x02]);
        hello_body.extend_from_slice(&[0x13, 0x01]);
        hello_body.push(0x01);
        hello_body.push(0x00);
        hello_body.extend_from_slice(&[0x00, 0x00]); // extensions len = 0

        let mut handshake = vec![0x01];
        let len = hello_body.len() as u32;
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&hello_body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        assert_eq!(extract_sni(&record), None);
    }
}
