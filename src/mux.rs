use std::{future::Future, io, net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::{
    handshake::{read_header, with_timeout, write_header, HandshakeError},
    lifecycle::{dial, ForwardOptions, Route, ServeHandle},
    pipe::pipe,
    protocol::TunnelId,
};

/// Where the multiplex listener looks up the target for an identifier.
pub trait RouteTable: Send + Sync {
    /// Returns a route for `id` if a running mapping owns it. The route must be
    /// held for as long as the session it was handed out for lasts.
    fn route(&self, id: &TunnelId) -> impl Future<Output = Option<Route>> + Send;
}

/// The one shared listener of multiplex mode.
///
/// Bound once at process start; mappings come and go in its [`RouteTable`]
/// without touching the socket. Every connection must open with an identifier
/// header. Unknown identifiers and unreachable targets are dropped without a
/// reply, a known one is echoed back once its target is connected.
#[derive(Debug)]
pub struct MuxServer {
    handle: ServeHandle,
}

impl MuxServer {
    pub async fn bind<R>(addr: SocketAddr, routes: Arc<R>, options: ForwardOptions) -> io::Result<Self>
    where
        R: RouteTable + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let span = info_span!("mux", %local_addr);
        let handshake_cancel = cancel.clone();
        let queue_depth = options.queue_depth;
        let handle = span.in_scope(|| {
            ServeHandle::spawn(listener, queue_depth, cancel, move |conn, _peer| {
                serve_connection(
                    conn,
                    routes.clone(),
                    options.clone(),
                    handshake_cancel.clone(),
                )
            })
        })?;

        info!("tunnel server listens at {}", local_addr);
        Ok(MuxServer { handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Stops accepting and waits for every open connection to finish.
    ///
    /// Connections still in the handshake are dropped; established tunnels drain.
    pub async fn shutdown(&mut self) {
        self.handle.shutdown().await;
        info!("tunnel server on {} stopped", self.handle.local_addr());
    }
}

async fn serve_connection<R>(
    mut inbound: TcpStream,
    routes: Arc<R>,
    options: ForwardOptions,
    cancel: CancellationToken,
) where
    R: RouteTable,
{
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("server stopping, dropping connection in handshake");
            return;
        }
        opened = open_tunnel(&mut inbound, routes.as_ref(), &options) => opened,
    };

    let (route, outbound) = match opened {
        Ok(Some(opened)) => opened,
        Ok(None) => return,
        Err(err) => {
            warn!("handshake failed: {}", err);
            return;
        }
    };

    let stats = pipe(inbound, outbound).await;
    debug!(
        "tunnel to {} closed, {}/{} bytes forwarded",
        route.target, stats.a_to_b, stats.b_to_a
    );
}

/// Server half of the handshake. `Ok(None)` means the connection is to be
/// closed without a word.
async fn open_tunnel<R>(
    inbound: &mut TcpStream,
    routes: &R,
    options: &ForwardOptions,
) -> Result<Option<(Route, TcpStream)>, HandshakeError>
where
    R: RouteTable,
{
    let id = with_timeout(options.handshake_timeout, read_header(inbound)).await?;

    let Some(route) = routes.route(&id).await else {
        debug!("unknown identifier {:?}", id.as_str());
        return Ok(None);
    };

    let outbound = match dial(route.target, options.dial_timeout).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!("failed to connect to {} for {}: {}", route.target, id, err);
            return Ok(None);
        }
    };
    if route.is_cancelled() {
        debug!("mapping {} removed during handshake", id);
        return Ok(None);
    }

    with_timeout(options.handshake_timeout, async {
        write_header(inbound, &id).await.map_err(HandshakeError::from)
    })
    .await?;

    info!("{} -> {}", id, route.target);
    Ok(Some((route, outbound)))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };

    use super::*;
    use crate::{
        lifecycle::ActiveMapping,
        protocol::{MappingKey, MappingRecord},
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// Fixed identifier table for exercising the server on its own.
    struct StaticRoutes(HashMap<TunnelId, ActiveMapping>);

    impl RouteTable for StaticRoutes {
        async fn route(&self, id: &TunnelId) -> Option<Route> {
            self.0.get(id).and_then(ActiveMapping::route)
        }
    }

    async fn routes(entries: &[(&str, SocketAddr)]) -> Arc<StaticRoutes> {
        let mut table = HashMap::new();
        for (id, target) in entries {
            let id = TunnelId::new(*id).unwrap();
            let record = MappingRecord::new(MappingKey::Id(id.clone()), target.to_string());
            let mut mapping = ActiveMapping::new(record, *target);
            mapping.start(&ForwardOptions::default()).await.unwrap();
            table.insert(id, mapping);
        }
        Arc::new(StaticRoutes(table))
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn mux(routes: Arc<StaticRoutes>, options: ForwardOptions) -> MuxServer {
        MuxServer::bind("127.0.0.1:0".parse().unwrap(), routes, options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn echoes_identifier_then_pipes() {
        let target = echo_server().await;
        let mut server = mux(routes(&[("abc", target)]).await, ForwardOptions::default()).await;

        let mut conn = TcpStream::connect(server.local_addr()).await.unwrap();
        conn.write_all(&[3, b'a', b'b', b'c']).await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(WAIT, conn.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, &[3, b'a', b'b', b'c']);

        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(WAIT, conn.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"hello");

        drop(conn);
        timeout(WAIT, server.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_identifier_gets_no_reply() {
        let target = echo_server().await;
        let mut server = mux(routes(&[("abc", target)]).await, ForwardOptions::default()).await;

        let mut conn = TcpStream::connect(server.local_addr()).await.unwrap();
        conn.write_all(&[3, b'x', b'y', b'z']).await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        timeout(WAIT, server.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_target_gets_no_reply() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut server = mux(routes(&[("abc", closed)]).await, ForwardOptions::default()).await;

        let mut conn = TcpStream::connect(server.local_addr()).await.unwrap();
        conn.write_all(&[3, b'a', b'b', b'c']).await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        timeout(WAIT, server.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_timeout() {
        let target = echo_server().await;
        let options = ForwardOptions {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut server = mux(routes(&[("abc", target)]).await, options).await;

        let mut conn = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        timeout(WAIT, server.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn bad_header_does_not_stop_the_listener() {
        let target = echo_server().await;
        let mut server = mux(routes(&[("abc", target)]).await, ForwardOptions::default()).await;

        let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
        bad.write_all(&[0]).await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, bad.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        let mut good = TcpStream::connect(server.local_addr()).await.unwrap();
        good.write_all(&[3, b'a', b'b', b'c', b'!']).await.unwrap();
        let mut buf = [0u8; 5];
        timeout(WAIT, good.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, &[3, b'a', b'b', b'c', b'!']);

        drop(good);
        timeout(WAIT, server.shutdown()).await.unwrap();
    }
}
