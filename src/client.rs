use std::{io, net::SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::{
    handshake::{client_handshake, with_timeout},
    lifecycle::{dial, ForwardOptions, ServeHandle},
    pipe::pipe,
    protocol::TunnelId,
};

/// Local end of a multiplexed tunnel.
///
/// Listens on a local address; every accepted connection is carried to the
/// tunnel server, announced with the configured identifier, and piped once the
/// server has echoed it.
#[derive(Debug)]
pub struct TunnelClient {
    id: TunnelId,
    server: SocketAddr,
    handle: ServeHandle,
}

impl TunnelClient {
    pub async fn start(
        listen: SocketAddr,
        server: SocketAddr,
        id: TunnelId,
        options: ForwardOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;

        let span = info_span!("client", %id);
        let queue_depth = options.queue_depth;
        let tunnel_id = id.clone();
        let handle = span.in_scope(|| {
            ServeHandle::spawn(
                listener,
                queue_depth,
                CancellationToken::new(),
                move |conn, _peer| {
                    carry_connection(conn, server, tunnel_id.clone(), options.clone())
                },
            )
        })?;

        info!("tunnel {} listens at {} via {}", id, local_addr, server);
        Ok(TunnelClient { id, server, handle })
    }

    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Stops accepting and waits for open tunnels to finish.
    pub async fn shutdown(&mut self) {
        self.handle.shutdown().await;
        info!("tunnel {} on {} stopped", self.id, self.handle.local_addr());
    }
}

async fn carry_connection(
    inbound: TcpStream,
    server: SocketAddr,
    id: TunnelId,
    options: ForwardOptions,
) {
    let mut outbound = match dial(server, options.dial_timeout).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!("failed to connect to tunnel server {}: {}", server, err);
            return;
        }
    };

    if let Err(err) = with_timeout(
        options.handshake_timeout,
        client_handshake(&mut outbound, &id),
    )
    .await
    {
        warn!("tunnel {} refused by {}: {}", id, server, err);
        return;
    }
    debug!("tunnel {} open", id);

    let stats = pipe(inbound, outbound).await;
    debug!(
        "tunnel {} closed, {}/{} bytes forwarded",
        id, stats.a_to_b, stats.b_to_a
    );
}
