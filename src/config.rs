//! Configuration file format.
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! mux_listen = "0.0.0.0:7000"
//! store = "data/mappings.json"
//!
//! [[server.mappings]]
//! key = 8001
//! target = "10.0.0.5:22"
//!
//! [[server.mappings]]
//! key = "db"
//! target = "db.internal:5432"
//!
//! [client]
//! listen = "127.0.0.1:5432"
//! server = "tunnel.example.com:7000"
//! id = "db"
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    handshake::DEFAULT_HANDSHAKE_TIMEOUT,
    lifecycle::{ForwardOptions, DEFAULT_DIAL_TIMEOUT, DEFAULT_QUEUE_DEPTH},
    protocol::{MappingRecord, TunnelId},
    Error,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub log_level: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            client: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared listener for identifier mappings; multiplex mode is off without it.
    pub mux_listen: Option<SocketAddr>,
    /// Address port mappings bind on
    pub bind_host: IpAddr,
    /// Mapping store file, its directory is created on startup
    pub store: PathBuf,
    /// Start empty instead of reseeding from the store
    pub no_load: bool,
    pub handshake_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub queue_depth: usize,
    /// Mappings added at startup unless their key is already present.
    pub mappings: Vec<MappingRecord>,
}

impl ServerConfig {
    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            bind_host: self.bind_host,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            queue_depth: self.queue_depth,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mux_listen: None,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            store: PathBuf::from("data/mappings.json"),
            no_load: false,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            mappings: Vec::new(),
        }
    }
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_dial_timeout_secs() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Local address applications connect to
    pub listen: SocketAddr,
    /// Tunnel server, `host:port`
    pub server: String,
    pub id: TunnelId,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(listen: SocketAddr, server: impl Into<String>, id: TunnelId) -> Self {
        Self {
            listen,
            server: server.into(),
            id,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
        }
    }

    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MappingKey;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_server_and_client() {
        let config = Config::parse(
            r#"
            log_level = "debug"

            [server]
            mux_listen = "127.0.0.1:7000"
            store = "/tmp/portmux/mappings.json"
            handshake_timeout_secs = 3

            [[server.mappings]]
            key = 8001
            target = "10.0.0.5:22"

            [[server.mappings]]
            key = "db"
            target = "db.internal:5432"

            [client]
            listen = "127.0.0.1:5432"
            server = "tunnel.example.com:7000"
            id = "db"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        let server = config.server.unwrap();
        assert_eq!(server.mux_listen, Some("127.0.0.1:7000".parse().unwrap()));
        assert_eq!(server.store, PathBuf::from("/tmp/portmux/mappings.json"));
        assert!(!server.no_load);
        assert_eq!(server.dial_timeout_secs, DEFAULT_DIAL_TIMEOUT.as_secs());
        assert_eq!(
            server.forward_options().handshake_timeout,
            Duration::from_secs(3)
        );
        assert_eq!(
            server.mappings,
            vec![
                MappingRecord::new(MappingKey::try_from(8001u16).unwrap(), "10.0.0.5:22"),
                MappingRecord::new(
                    MappingKey::Id(TunnelId::new("db").unwrap()),
                    "db.internal:5432"
                ),
            ]
        );

        let client = config.client.unwrap();
        assert_eq!(client.id.as_str(), "db");
        assert_eq!(client.server, "tunnel.example.com:7000");
        assert_eq!(client.forward_options().handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn client_timeouts_are_configurable() {
        let config = Config::parse(
            r#"
            [client]
            listen = "127.0.0.1:5432"
            server = "tunnel.example.com:7000"
            id = "db"
            handshake_timeout_secs = 2
            dial_timeout_secs = 4
            "#,
        )
        .unwrap();

        let options = config.client.unwrap().forward_options();
        assert_eq!(options.handshake_timeout, Duration::from_secs(2));
        assert_eq!(options.dial_timeout, Duration::from_secs(4));

        let defaults = ClientConfig::new(
            "127.0.0.1:5432".parse().unwrap(),
            "tunnel.example.com:7000",
            TunnelId::new("db").unwrap(),
        );
        assert_eq!(defaults.forward_options().dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn rejects_bad_identifier() {
        let res = Config::parse(
            r#"
            [client]
            listen = "127.0.0.1:5432"
            server = "tunnel.example.com:7000"
            id = ""
            "#,
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("nope.toml")),
            Err(Error::Config(_))
        ));
    }
}
