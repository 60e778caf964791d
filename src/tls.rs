//! Server-side TLS termination against the client, plus the client TLS
//! config used when forwarding to an `https://` origin.
//!
//! This proxy never authenticates a client by certificate — only by the
//! Basic/x-proxy-secret credential check — so the server config here is a
//! plain single-cert `ServerConfig` with no client-auth builder step.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::model::CertBundle;

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: Result<Vec<CertificateDer>, _> = parsed
        .map(|res| res.map(CertificateDer::from))
        .collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

/// Loads the cert chain + key the config points at into a `CertBundle`.
pub fn load_cert_bundle<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<CertBundle> {
    Ok(CertBundle {
        certs: cert_reader(cert_path)?,
        key: privkey_reader(key_path)?,
    })
}

/// Builds the `ServerConfig` C6 hands to `tokio_rustls::TlsAcceptor` to
/// terminate the client's TLS connection. No client-cert verification:
/// this proxy authenticates clients (if at all) via the Basic/x-proxy-secret
/// credential check, not mTLS.
pub fn build_server_config(bundle: &CertBundle) -> Result<ServerConfig> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(bundle.certs.clone(), bundle.key.clone_key())?;
    Ok(config)
}

/// Builds the `ClientConfig` C4 uses when dialing an `https://` forward
/// target. Uses the public Mozilla root store (`webpki-roots`) rather than
/// a configured CA file — this crate is a general-purpose forward proxy,
/// not a fixed mTLS sidecar, so it has no single trusted CA to pin.
pub fn build_client_config() -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    /// Throwaway self-signed cert for exercising the C6 server config
    /// without reading real PEM files off disk. Returns the server-side
    /// bundle plus the raw cert DER the test client trusts directly
    /// (self-signed, so the "root" the client trusts is the leaf itself).
    fn throwaway_bundle(hostname: &str) -> (CertBundle, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
        let cert_der_bytes = cert.serialize_der().unwrap();
        let key_der = PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());
        let bundle = CertBundle {
            certs: vec![CertificateDer::from(cert_der_bytes.clone())],
            key: key_der,
        };
        (bundle, cert_der_bytes)
    }

    #[test]
    fn server_config_builds_from_cert_bundle() {
        let (bundle, _) = throwaway_bundle("example.test");
        build_server_config(&bundle).unwrap();
    }

    /// C6: a client-side TLS handshake against the server config built
    /// here succeeds, and decrypted bytes flow in both directions —
    /// the termination step `dispatch.rs` relies on before handing the
    /// plaintext stream to C4.
    #[tokio::test]
    async fn server_terminates_client_tls_and_decrypts() {
        let hostname = "example.test";
        let (bundle, cert_der) = throwaway_bundle(hostname);
        let server_cfg = Arc::new(build_server_config(&bundle).unwrap());
        let acceptor = TlsAcceptor::from(server_cfg);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(sock).await.unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(b"world").await.unwrap();
            buf
        });

        let mut roots = rustls::RootCertStore::empty();
        roots.add(CertificateDer::from(cert_der)).unwrap();
        let client_cfg = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let connector = TlsConnector::from(client_cfg);
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from(hostname.to_string()).unwrap();
        let mut client_tls = connector.connect(server_name, tcp).await.unwrap();

        client_tls.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client_tls.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");

        let received = server.await.unwrap();
        assert_eq!(&received, b"hello");
    }
}
