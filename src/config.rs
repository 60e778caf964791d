//! Configuration: CLI flags (clap) layered over an optional YAML config
//! file (serde_yaml).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::model::{CertBundle, Credential};
use crate::tls;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 1080;

#[derive(Parser, Debug)]
#[command(name = "multiproxy", version, about = "SOCKS5 / HTTP / TLS-SNI forward proxy")]
pub struct Cli {
    /// Path to an optional YAML config file; CLI flags override its values
    /// whenever they differ from this struct's defaults.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[arg(long = "host", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long = "username", default_value = "")]
    pub username: String,

    #[arg(long = "password", default_value = "")]
    pub password: String,

    #[arg(long = "certificate-cert")]
    pub certificate_cert: Option<PathBuf>,

    #[arg(long = "certificate-key")]
    pub certificate_key: Option<PathBuf>,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub certificate: Option<CertificatePaths>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Fully resolved runtime configuration: CLI flags merged over an optional
/// YAML file, plus the loaded credential/cert material ready to hand to
/// the dispatcher.
pub struct Config {
    pub listen_addr: String,
    pub credential: Option<Credential>,
    pub cert_bundle: Option<CertBundle>,
}

/// Parses CLI flags, loads the YAML file named by `-c` (if any), and
/// merges them: a CLI flag only overrides the file's value when it
/// differs from this flag's own default.
pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let file_cfg = match &cli.config {
        Some(path) => {
            let yaml = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yaml::from_str(&yaml)
                .with_context(|| format!("failed to parse YAML in {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let host = if cli.host != DEFAULT_HOST {
        cli.host.clone()
    } else {
        file_cfg
            .listen_addr
            .clone()
            .and_then(|addr| addr.rsplit_once(':').map(|(h, _)| h.to_string()))
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    };
    let port = if cli.port != DEFAULT_PORT {
        cli.port
    } else {
        file_cfg
            .listen_addr
            .as_deref()
            .and_then(|addr| addr.rsplit_once(':'))
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    };
    let listen_addr = format!("{host}:{port}");

    let username = if !cli.username.is_empty() {
        Some(cli.username.clone())
    } else {
        file_cfg.username.clone()
    };
    let password = if !cli.password.is_empty() {
        Some(cli.password.clone())
    } else {
        file_cfg.password.clone()
    };
    let credential = match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() => {
            Some(Credential { username, password })
        }
        _ => None,
    };

    let cert_paths = match (&cli.certificate_cert, &cli.certificate_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => file_cfg
            .certificate
            .as_ref()
            .map(|c| (c.cert.clone(), c.key.clone())),
    };
    let cert_bundle = match cert_paths {
        Some((cert, key)) => Some(tls::load_cert_bundle(cert, key)?),
        None => None,
    };

    let cfg = Config {
        listen_addr,
        credential,
        cert_bundle,
    };
    Ok((cli, cfg))
}
