//! # Portmux
//!
//! This crate provides a TCP port-forwarding service whose mappings can be
//! added and removed at runtime and survive restarts.
//!
//! ## Forwarding modes
//!
//! A mapping forwards to a `host:port` target and is keyed one of two ways:
//!
//! - **Direct**: keyed by a local port. The mapping owns a listener on that
//!   port and every accepted connection is piped to the target.
//! - **Multiplex**: keyed by a short identifier. All identifier mappings share
//!   one listener; a connecting client first announces the identifier it wants
//!   (see [`handshake`]), the server echoes it back once the target is
//!   connected, and from then on bytes flow unchanged.
//!
//! The client side of multiplex mode is [`TunnelClient`]: it listens locally
//! and carries each accepted connection to the server under a fixed identifier.
//!
//! ## Lifecycle
//!
//! Mappings live in a [`Registry`] backed by a [`MappingStore`]. Every change
//! is persisted before it takes effect, and on startup [`Registry::restore`]
//! brings back what the store holds. Removing a mapping stops it from taking
//! new connections at once and returns after its open connections have ended.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use portmux::{
//!     lifecycle::ForwardOptions, store::JsonFileStore, MappingKey, MappingRecord, MuxServer,
//!     Registry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> portmux::Result<()> {
//!     let store = JsonFileStore::open("data/mappings.json").await?;
//!     let registry = Arc::new(Registry::new(store, ForwardOptions::default()));
//!     registry.restore().await?;
//!
//!     let mut mux = MuxServer::bind(
//!         "0.0.0.0:7000".parse().unwrap(),
//!         registry.clone(),
//!         ForwardOptions::default(),
//!     )
//!     .await?;
//!
//!     registry
//!         .add(MappingRecord::new(MappingKey::try_from(8022u16).unwrap(), "10.0.0.5:22"))
//!         .await?;
//!     registry
//!         .add(MappingRecord::new("db".parse::<MappingKey>().unwrap(), "db.internal:5432"))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     mux.shutdown().await;
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::io;

use thiserror::Error;

pub mod client;
pub mod config;
pub mod handshake;
pub mod lifecycle;
pub mod mux;
pub mod pipe;
pub mod protocol;
pub mod registry;
pub mod store;

pub use client::TunnelClient;
pub use config::Config;
pub use mux::{MuxServer, RouteTable};
pub use protocol::{MappingKey, MappingRecord, TunnelId};
pub use registry::{Registry, RegistryError};
pub use store::{MappingStore, StoreError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Handshake(#[from] handshake::HandshakeError),
    #[error(transparent)]
    Address(#[from] protocol::AddressError),
    #[error("{0}")]
    Config(String),
    #[error("Error in network operation")]
    IoError(#[from] io::Error),
}
