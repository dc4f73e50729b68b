//! Configuration loading.
//!
//! JSON is the sole config source; unknown top-level keys are ignored.
//! Grounded on `forwarder::config`'s raw-then-validated two-struct
//! pattern, adapted from TOML to JSON for this service's wire format.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub domains: Vec<DomainConfig>,
    pub signalling_server: SocketAddr,
    pub reconnect_interval_secs: u64,
    pub lock_timeout_msecs: u64,
}

#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    pub path: String,
    pub certificate: Option<CertificateConfig>,
}

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub file: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    webserver: Option<RawWebserver>,
    signalling_server: Option<String>,
    reconnect_interval_secs: Option<u64>,
    lock_timeout_msecs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawWebserver {
    socket: Option<RawSocket>,
    domains: Option<Vec<RawDomain>>,
}

#[derive(Debug, Deserialize)]
struct RawSocket {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawDomain {
    name: Option<String>,
    path: Option<String>,
    certificate: Option<RawCertificate>,
}

#[derive(Debug, Deserialize)]
struct RawCertificate {
    file: Option<String>,
    key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing config JSON: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
    load_config_from_str(&text)
}

pub fn load_config_from_str(text: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let (raw_socket, raw_domains) = match raw.webserver {
        Some(w) => (w.socket, w.domains.unwrap_or_default()),
        None => (None, Vec::new()),
    };
    let mut domains = Vec::with_capacity(raw_domains.len());
    for (i, d) in raw_domains.into_iter().enumerate() {
        let name = d.name.ok_or_else(|| ConfigError::MissingField(format!("webserver.domains[{i}].name")))?;
        let path = d.path.ok_or_else(|| ConfigError::MissingField(format!("webserver.domains[{i}].path")))?;
        let certificate = match d.certificate {
            Some(c) => Some(CertificateConfig {
                file: c.file.ok_or_else(|| ConfigError::MissingField(format!("webserver.domains[{i}].certificate.file")))?,
                key: c.key.ok_or_else(|| ConfigError::MissingField(format!("webserver.domains[{i}].certificate.key")))?,
            }),
            None => None,
        };
        domains.push(DomainConfig { name, path, certificate });
    }

    let signalling_server_raw = raw
        .signalling_server
        .ok_or_else(|| ConfigError::MissingField("signalling_server".to_string()))?;
    let signalling_server = signalling_server_raw
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidValue { field: "signalling_server".to_string(), reason: e.to_string() })?;

    let host = raw_socket.as_ref().and_then(|s| s.host.clone()).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = raw_socket.as_ref().and_then(|s| s.port).unwrap_or(443);
    let listen_addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidValue { field: "webserver.socket".to_string(), reason: e.to_string() })?;

    Ok(Config {
        listen_addr,
        domains,
        signalling_server,
        reconnect_interval_secs: raw.reconnect_interval_secs.unwrap_or(5),
        lock_timeout_msecs: raw.lock_timeout_msecs.unwrap_or(2_000),
    })
}

/// Derive a default config path from the invoked binary's own name, used
/// when `-c` is absent.
pub fn default_config_path() -> std::path::PathBuf {
    let exe_name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "webserver".to_string());
    std::path::PathBuf::from(format!("/etc/openvocs/{exe_name}.json"))
}
