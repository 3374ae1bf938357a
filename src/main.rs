use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use portmux::{
    config::{ClientConfig, ServerConfig},
    protocol::resolve_target,
    store::JsonFileStore,
    Config, MuxServer, Registry, TunnelClient, TunnelId,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Runtime-managed TCP port forwarding", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the forwarding server: direct port mappings plus the multiplex listener
    Server {
        /// Shared listener for identifier mappings
        #[arg(long)]
        mux_listen: Option<SocketAddr>,
        /// Mapping store file
        #[arg(long)]
        store: Option<PathBuf>,
        /// Do not restore mappings from the store
        #[arg(short = 'n', long)]
        no_load: bool,
    },
    /// Run a tunnel client carrying local connections to a multiplex server
    Client {
        /// Local address to listen on
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Tunnel server, host:port
        #[arg(long)]
        server: Option<String>,
        /// Identifier announced to the server
        #[arg(long)]
        id: Option<TunnelId>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Server {
            mux_listen,
            store,
            no_load,
        } => {
            let mut server = config.server.unwrap_or_default();
            if mux_listen.is_some() {
                server.mux_listen = mux_listen;
            }
            if let Some(store) = store {
                server.store = store;
            }
            server.no_load |= no_load;
            run_server(server).await
        }
        Command::Client { listen, server, id } => {
            let file = config.client;
            let mut client = ClientConfig::new(
                listen
                    .or(file.as_ref().map(|c| c.listen))
                    .ok_or("client needs a listen address")?,
                server
                    .or(file.as_ref().map(|c| c.server.clone()))
                    .ok_or("client needs a server address")?,
                id.or(file.as_ref().map(|c| c.id.clone()))
                    .ok_or("client needs an identifier")?,
            );
            if let Some(file) = file {
                client.handshake_timeout_secs = file.handshake_timeout_secs;
                client.dial_timeout_secs = file.dial_timeout_secs;
            }
            run_client(client).await
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let (registry, mut mux) = start_server(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(mux) = mux.as_mut() {
        mux.shutdown().await;
    }
    registry.shutdown().await;
    Ok(())
}

type Server = (Arc<Registry<JsonFileStore>>, Option<MuxServer>);

async fn start_server(config: ServerConfig) -> Result<Server, Box<dyn Error>> {
    let options = config.forward_options();
    let store = JsonFileStore::open(&config.store).await?;
    let registry = Arc::new(Registry::new(store, options.clone()));

    // the shared listener is the only startup failure that ends the process,
    // so it is bound before anything is restored or persisted
    let mux = match config.mux_listen {
        Some(addr) => Some(MuxServer::bind(addr, registry.clone(), options).await?),
        None => None,
    };

    if config.no_load {
        info!("not restoring mappings from {:?}", config.store);
    } else {
        let report = registry.restore().await?;
        info!(
            "restored {} mappings from {:?}",
            report.restored, config.store
        );
        if !report.failed.is_empty() {
            warn!("{} stored mappings could not be started", report.failed.len());
        }
    }

    let seeded = registry.add_missing(config.mappings).await;
    if seeded > 0 {
        info!("added {} mappings from the configuration", seeded);
    }
    Ok((registry, mux))
}

async fn run_client(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let server = resolve_target(&config.server).await?;
    let options = config.forward_options();
    let mut client = TunnelClient::start(config.listen, server, config.id, options).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    client.shutdown().await;
    Ok(())
}
