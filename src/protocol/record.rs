use std::{io, net::SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::trace;

use super::MappingKey;

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("invalid target address {target:?}")]
    Unresolvable {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("target address {0:?} did not resolve to any endpoint")]
    NoEndpoints(String),
    #[error("target address {0:?} has port 0")]
    ZeroPort(String),
}

/// The persisted unit: which key forwards to which `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub key: MappingKey,
    pub target: String,
}

impl MappingRecord {
    pub fn new(key: impl Into<MappingKey>, target: impl Into<String>) -> Self {
        MappingRecord {
            key: key.into(),
            target: target.into(),
        }
    }

    pub async fn resolve_target(&self) -> Result<SocketAddr, AddressError> {
        resolve_target(&self.target).await
    }
}

/// Resolves a `host:port` string to a single TCP endpoint, preferring IPv4.
///
/// Literal socket addresses skip the resolver entirely.
pub async fn resolve_target(target: &str) -> Result<SocketAddr, AddressError> {
    let addr = match target.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => {
            trace!("lookup_host {}", target);
            let addrs: Vec<SocketAddr> = lookup_host(target)
                .await
                .map_err(|source| AddressError::Unresolvable {
                    target: target.to_owned(),
                    source,
                })?
                .collect();

            addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| AddressError::NoEndpoints(target.to_owned()))?
        }
    };

    if addr.port() == 0 {
        return Err(AddressError::ZeroPort(target.to_owned()));
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_and_named_targets() {
        let addr = resolve_target("127.0.0.1:9001").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9001".parse().unwrap());

        let addr = resolve_target("localhost:9001").await.unwrap();
        assert_eq!(addr.port(), 9001);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn rejects_malformed_targets() {
        assert!(matches!(
            resolve_target("no-port-here").await,
            Err(AddressError::Unresolvable { .. })
        ));
        assert!(matches!(
            resolve_target("127.0.0.1:0").await,
            Err(AddressError::ZeroPort(_))
        ));
    }

    #[test]
    fn record_json_shape() {
        let record: MappingRecord =
            serde_json::from_str(r#"{"key": 8001, "target": "127.0.0.1:9001"}"#).unwrap();
        assert_eq!(record.key.port(), Some(8001));
        assert_eq!(record.target, "127.0.0.1:9001");

        let record: MappingRecord =
            serde_json::from_str(r#"{"key": "abc", "target": "127.0.0.1:9002"}"#).unwrap();
        assert_eq!(record.key.tunnel_id().unwrap().as_str(), "abc");
    }
}
