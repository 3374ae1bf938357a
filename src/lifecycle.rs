use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use socket2::{SockRef, TcpKeepalive};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::{
    sync::CancellationToken,
    task::{task_tracker::TaskTrackerToken, TaskTracker},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    handshake::DEFAULT_HANDSHAKE_TIMEOUT,
    pipe::pipe,
    protocol::{MappingKey, MappingRecord},
};

/// Connections accepted but not yet dispatched, per listener.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time before the first keepalive probe on forwarded connections.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);

// Pause after a failed accept so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Knobs shared by every listener the process runs.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Address direct-mode mappings bind their port on.
    pub bind_host: IpAddr,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        ForwardOptions {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Enables TCP keepalive so a peer that vanished without a FIN is eventually
/// noticed and the pipe holding the connection can finish.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))
}

/// Connects to `target`, failing with `TimedOut` after `limit`.
pub async fn dial(target: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(limit, TcpStream::connect(target))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    stream.set_nodelay(true)?;
    set_keepalive(&stream)?;
    Ok(stream)
}

/// Runs the accept side of a listener until `cancel` fires.
///
/// Accepting and dispatching are two loops joined by a bounded queue: the
/// accept loop never waits on a slow handler, and the dispatch loop sees the
/// cancellation between dequeues. The accept loop checks `cancel` right before
/// every enqueue and is the only sender, so the queue closes only once it has
/// exited. Every handler is spawned on `sessions`.
///
/// The returned handle completes once both loops are gone and the listener is closed.
pub fn serve<F, Fut>(
    listener: TcpListener,
    queue_depth: usize,
    cancel: CancellationToken,
    sessions: TaskTracker,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (queue_tx, queue_rx) = mpsc::channel(queue_depth.max(1));
    let accepting = accept_loop(listener, queue_tx, cancel.clone());
    let dispatching = dispatch_loop(queue_rx, cancel, sessions, Arc::new(handler));
    tokio::spawn(
        async move {
            tokio::join!(accepting, dispatching);
        }
        .in_current_span(),
    )
}

/// A process-level listener (the multiplex port, the tunnel client) running [`serve`].
#[derive(Debug)]
pub struct ServeHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    sessions: TaskTracker,
    accept_loop: Option<JoinHandle<()>>,
}

impl ServeHandle {
    /// Starts serving `listener`. `cancel` is the signal that [`ServeHandle::shutdown`]
    /// fires; handlers may watch it too.
    pub fn spawn<F, Fut>(
        listener: TcpListener,
        queue_depth: usize,
        cancel: CancellationToken,
        handler: F,
    ) -> io::Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let sessions = TaskTracker::new();
        let accept_loop = serve(
            listener,
            queue_depth,
            cancel.clone(),
            sessions.clone(),
            handler,
        );
        Ok(ServeHandle {
            local_addr,
            cancel,
            sessions,
            accept_loop: Some(accept_loop),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for every spawned handler to finish. Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.sessions.close();
        if let Some(handle) = self.accept_loop.take() {
            if let Err(err) = handle.await {
                warn!("accept loop on {} ended abnormally: {}", self.local_addr, err);
            }
        }
        self.sessions.wait().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (conn, peer) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                warn!("accept failed: {}", err);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                }
            }
        };
        debug!("Received connection from: {}", peer);
        if let Err(err) = set_keepalive(&conn) {
            debug!("failed to enable keepalive for {}: {}", peer, err);
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = queue.send((conn, peer)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn dispatch_loop<F, Fut>(
    mut queue: mpsc::Receiver<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
    sessions: TaskTracker,
    handler: Arc<F>,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some((conn, peer)) = next else {
            break;
        };

        let connection = info_span!("connection", %peer);
        sessions.spawn(handler(conn, peer).instrument(connection));
    }
    debug!("dispatch loop stopped");
}

/// Dials `target` and pipes `inbound` to it until both sides are done.
pub async fn forward_connection(inbound: TcpStream, target: SocketAddr, dial_timeout: Duration) {
    let outbound = match dial(target, dial_timeout).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!("failed to connect to {}: {}", target, err);
            return;
        }
    };
    debug!("pipe -> {}", target);

    let stats = pipe(inbound, outbound).await;
    debug!(
        "connection closed, {}/{} bytes forwarded",
        stats.a_to_b, stats.b_to_a
    );
}

/// A handle the multiplex dispatcher holds for the life of one session.
///
/// Holding it keeps the owning mapping's completion barrier open, so deleting
/// the mapping waits for the session to finish.
#[derive(Debug)]
pub struct Route {
    pub target: SocketAddr,
    cancel: CancellationToken,
    _session: TaskTrackerToken,
}

impl Route {
    /// True once the owning mapping has started stopping.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a route lookup needs from a running mapping, detached from the mapping
/// itself so lookups never wait on the registry's table.
#[derive(Debug, Clone)]
pub struct RouteSource {
    target: SocketAddr,
    cancel: CancellationToken,
    sessions: TaskTracker,
}

impl RouteSource {
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Registers one session. `None` once the mapping has started stopping.
    pub fn route(&self) -> Option<Route> {
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(Route {
            target: self.target,
            cancel: self.cancel.clone(),
            _session: self.sessions.token(),
        })
    }
}

/// The runtime side of one mapping.
///
/// Port mappings own their listener and accept loop. Identifier mappings own
/// no socket: the shared multiplex listener looks them up through
/// [`ActiveMapping::route`] and their sessions are accounted for here all the same.
#[derive(Debug)]
pub struct ActiveMapping {
    record: MappingRecord,
    target: SocketAddr,
    state: LifecycleState,
    cancel: CancellationToken,
    sessions: TaskTracker,
    accept_loop: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ActiveMapping {
    pub fn new(record: MappingRecord, target: SocketAddr) -> Self {
        ActiveMapping {
            record,
            target,
            state: LifecycleState::Created,
            cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
            accept_loop: None,
            local_addr: None,
        }
    }

    pub fn record(&self) -> &MappingRecord {
        &self.record
    }

    pub fn key(&self) -> &MappingKey {
        &self.record.key
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The bound listener address, for port mappings that are running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Brings the mapping to `Running`.
    ///
    /// A port mapping binds its port here and a bind failure is returned as is;
    /// the mapping is then `Stopped` and holds no socket.
    pub async fn start(&mut self, options: &ForwardOptions) -> io::Result<()> {
        if self.state != LifecycleState::Created {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "mapping was already started",
            ));
        }
        self.state = LifecycleState::Starting;

        let port = match self.record.key.port() {
            Some(port) => port,
            None => {
                info!("new tunnel mapping {} -> {}", self.record.key, self.target);
                self.state = LifecycleState::Running;
                return Ok(());
            }
        };

        let listener = match TcpListener::bind((options.bind_host, port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.state = LifecycleState::Stopped;
                return Err(err);
            }
        };
        self.local_addr = listener.local_addr().ok();

        let target = self.target;
        let dial_timeout = options.dial_timeout;
        let span = info_span!("mapping", key = %self.record.key);
        let handle = span.in_scope(|| {
            serve(
                listener,
                options.queue_depth,
                self.cancel.clone(),
                self.sessions.clone(),
                move |conn, _peer| forward_connection(conn, target, dial_timeout),
            )
        });
        self.accept_loop = Some(handle);

        info!("new port mapping {} -> {}", self.record.key, self.target);
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// Registers one multiplexed session against this mapping.
    ///
    /// Returns `None` unless the mapping is running.
    pub fn route(&self) -> Option<Route> {
        self.route_source()?.route()
    }

    /// A handle that hands out routes for this mapping while it is running.
    pub fn route_source(&self) -> Option<RouteSource> {
        if self.state != LifecycleState::Running || self.cancel.is_cancelled() {
            return None;
        }
        Some(RouteSource {
            target: self.target,
            cancel: self.cancel.clone(),
            sessions: self.sessions.clone(),
        })
    }

    /// First half of stopping: no new work is taken once this returns.
    ///
    /// Fires the cancellation signal and waits for the accept loop to exit,
    /// which closes the listener and frees the port.
    pub async fn stop_accepting(&mut self) {
        match self.state {
            LifecycleState::Stopping | LifecycleState::Stopped => return,
            _ => {}
        }
        self.state = LifecycleState::Stopping;
        self.cancel.cancel();
        self.sessions.close();

        if let Some(handle) = self.accept_loop.take() {
            if let Err(err) = handle.await {
                warn!("accept loop for {} ended abnormally: {}", self.record.key, err);
            }
        }
        self.local_addr = None;
    }

    /// Second half of stopping: waits for every in-flight session to drain.
    pub async fn wait_stopped(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        self.stop_accepting().await;
        self.sessions.wait().await;
        self.state = LifecycleState::Stopped;
        info!("closed mapping {} -> {}", self.record.key, self.target);
    }

    /// Stops the mapping and waits until it is fully torn down. Idempotent.
    pub async fn stop(&mut self) {
        self.stop_accepting().await;
        self.wait_stopped().await;
    }
}
