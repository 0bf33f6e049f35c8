use log::LevelFilter;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BIND_ADDR: &str = ":2384";
pub const DEFAULT_DIRECTORY_ADDR: &str = "api.trisatest.net:443";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime settings consumed by [`Server::new`](crate::server::Server::new).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address; a leading `:` binds every interface.
    pub bind_addr: String,
    /// Directory service used to look up counterparties.
    pub directory_addr: String,
    /// Report `MAINTENANCE` from the status endpoint.
    pub maintenance: bool,
    /// PEM bundle holding the node certificate chain and private key.
    pub server_certs: PathBuf,
    /// PEM bundle of issuer certificates trusted for client authentication.
    pub server_cert_pool: PathBuf,
    pub log_level: String,
    pub console_log: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            directory_addr: DEFAULT_DIRECTORY_ADDR.to_string(),
            maintenance: false,
            server_certs: PathBuf::new(),
            server_cert_pool: PathBuf::new(),
            log_level: "info".to_string(),
            console_log: false,
        }
    }
}

impl NodeConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_addr must not be empty".into()));
        }
        if self.server_certs.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("server_certs path is required".into()));
        }
        if self.server_cert_pool.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("server_cert_pool path is required".into()));
        }
        self.log_filter()?;
        Ok(())
    }

    /// Bind address with the Go-style `:port` shorthand expanded.
    pub fn listen_addr(&self) -> String {
        let addr = self.bind_addr.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }

    pub fn log_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .trim()
            .parse::<LevelFilter>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.log_level)))
    }
}
