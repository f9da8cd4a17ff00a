//! # Harness configuration
//!
//! A scenario file is parsed into a [`FileConfig`], where every field is
//! optional, then resolved into a [`Config`] filled with defaults by
//! [`ConfigBuilder`]. Durations are written in milliseconds in the file.
//!
//! ```toml
//! log_level = "info,tandem_lib::reactor=debug"
//! chain_timeout = 5000
//! correlation_header = "x-tandem-request"
//!
//! [client]
//! address = "127.0.0.1:443"
//! segment_size = 1
//!
//! [client.tls]
//! alpn = ["h2"]
//! server_name = "example.com"
//!
//! [server]
//! address = "127.0.0.1:8000"
//! conns_n = 4
//! ```

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_TARGET: &str = "stdout";
/// granularity of the orchestrator loop
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
/// per message chain deadline
pub const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// largest read attempted on a socket in one go
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;
/// accepted skew between an expected and a received `Date` header
pub const DEFAULT_DATE_TOLERANCE: Duration = Duration::from_secs(5);
pub const DEFAULT_CLIENT_ADDRESS: &str = "127.0.0.1:80";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8000";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read file {path}: {error}")]
    FileRead { path: String, error: std::io::Error },
    #[error("could not parse toml file {path}: {error}")]
    DeserializeToml {
        path: String,
        error: Box<toml::de::Error>,
    },
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileTlsConfig {
    pub alpn: Option<Vec<String>>,
    pub server_name: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub verify: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileClientConfig {
    pub address: Option<SocketAddr>,
    pub bind_address: Option<SocketAddr>,
    pub segment_size: Option<usize>,
    pub segment_gap: Option<u64>,
    pub tls: Option<FileTlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileServerConfig {
    pub address: Option<SocketAddr>,
    pub conns_n: Option<usize>,
    pub keep_alive: Option<usize>,
    pub segment_size: Option<usize>,
    pub segment_gap: Option<u64>,
}

/// Parsed from a TOML file, every field may be missing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub log_level: Option<String>,
    pub log_target: Option<String>,
    pub log_colored: Option<bool>,
    pub tick: Option<u64>,
    pub chain_timeout: Option<u64>,
    pub max_message_size: Option<usize>,
    pub date_tolerance: Option<u64>,
    pub max_evictions: Option<usize>,
    pub correlation_header: Option<String>,
    pub client: Option<FileClientConfig>,
    pub server: Option<FileServerConfig>,
}

impl FileConfig {
    pub fn load_from_path(path: &str) -> Result<FileConfig, ConfigError> {
        let data = fs::read_to_string(Path::new(path)).map_err(|error| ConfigError::FileRead {
            path: path.to_owned(),
            error,
        })?;
        FileConfig::from_toml(&data).map_err(|error| ConfigError::DeserializeToml {
            path: path.to_owned(),
            error: Box::new(error),
        })
    }

    pub fn from_toml(data: &str) -> Result<FileConfig, toml::de::Error> {
        toml::from_str(data)
    }
}

/// TLS parameters handed to the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// ALPN protocols offered, in preference order
    pub alpn: Vec<String>,
    /// SNI sent in the ClientHello
    pub server_name: String,
    /// trust anchors, certificates are not checked without one unless `verify`
    pub ca_file: Option<PathBuf>,
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub address: SocketAddr,
    pub bind_address: Option<SocketAddr>,
    pub segment_size: usize,
    pub segment_gap: Duration,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// connections the SUT is expected to open before requests flow
    pub conns_n: usize,
    /// close a connection after that many responses
    pub keep_alive: Option<usize>,
    pub segment_size: usize,
    pub segment_gap: Duration,
}

/// Resolved configuration of one harness run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    pub log_target: String,
    pub log_colored: bool,
    pub tick: Duration,
    pub chain_timeout: Duration,
    pub max_message_size: usize,
    pub date_tolerance: Duration,
    /// evictions tolerated before they count as a violation, unlimited if `None`
    pub max_evictions: Option<usize>,
    pub correlation_header: Option<String>,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn load_from_path(path: &str) -> Result<Config, ConfigError> {
        ConfigBuilder::new(FileConfig::load_from_path(path)?).into_config()
    }
}

impl Default for Config {
    fn default() -> Self {
        // the defaults are all valid
        match ConfigBuilder::new(FileConfig::default()).into_config() {
            Ok(config) => config,
            Err(e) => unreachable!("default configuration is invalid: {e}"),
        }
    }
}

pub struct ConfigBuilder {
    file: FileConfig,
}

impl ConfigBuilder {
    pub fn new(file: FileConfig) -> Self {
        ConfigBuilder { file }
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let file = self.file;

        let tick = millis_or(file.tick, DEFAULT_TICK);
        if tick.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "tick",
                message: "the loop tick must be positive".to_owned(),
            });
        }
        let chain_timeout = millis_or(file.chain_timeout, DEFAULT_CHAIN_TIMEOUT);
        if chain_timeout < tick {
            return Err(ConfigError::InvalidValue {
                field: "chain_timeout",
                message: format!("{chain_timeout:?} is shorter than the tick {tick:?}"),
            });
        }
        let max_message_size = file.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        if max_message_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_message_size",
                message: "must be positive".to_owned(),
            });
        }
        if let Some(header) = &file.correlation_header {
            if header.is_empty() || header.contains(|c: char| c == ':' || c.is_whitespace()) {
                return Err(ConfigError::InvalidValue {
                    field: "correlation_header",
                    message: format!("'{header}' is not a header name"),
                });
            }
        }

        let client = file.client.unwrap_or_default();
        let server = file.server.unwrap_or_default();

        Ok(Config {
            log_level: file
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
            log_target: file
                .log_target
                .unwrap_or_else(|| DEFAULT_LOG_TARGET.to_owned()),
            log_colored: file.log_colored.unwrap_or(false),
            tick,
            chain_timeout,
            max_message_size,
            date_tolerance: file
                .date_tolerance
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DATE_TOLERANCE),
            max_evictions: file.max_evictions,
            correlation_header: file.correlation_header,
            client: ClientConfig {
                address: address_or(client.address, DEFAULT_CLIENT_ADDRESS, "client.address")?,
                bind_address: client.bind_address,
                segment_size: client.segment_size.unwrap_or(0),
                segment_gap: millis_or(client.segment_gap, Duration::ZERO),
                tls: client.tls.map(|tls| TlsSettings {
                    alpn: tls.alpn.unwrap_or_default(),
                    server_name: tls.server_name.unwrap_or_else(|| "localhost".to_owned()),
                    verify: tls.verify.unwrap_or(tls.ca_file.is_some()),
                    ca_file: tls.ca_file,
                }),
            },
            server: ServerConfig {
                address: address_or(server.address, DEFAULT_SERVER_ADDRESS, "server.address")?,
                conns_n: server.conns_n.unwrap_or(0),
                keep_alive: server.keep_alive,
                segment_size: server.segment_size.unwrap_or(0),
                segment_gap: millis_or(server.segment_gap, Duration::ZERO),
            },
        })
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn address_or(
    value: Option<SocketAddr>,
    default: &str,
    field: &'static str,
) -> Result<SocketAddr, ConfigError> {
    match value {
        Some(address) => Ok(address),
        None => default.parse().map_err(|e| ConfigError::InvalidValue {
            field,
            message: format!("{default}: {e}"),
        }),
    }
}
