//! TCP server implementation.

use crate::config::NetworkConfig;
use crate::connection::{ConnectionHandle, ConnectionReader};
use crate::error::ServerError;
use crate::handler::MessageHandler;
use crate::metrics::Metrics;
use crate::registry::Registry;
use nmq_protocol::{
    Decoder, Message, MessageAssembler, OpCode, ProtocolError, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, MAX_CONTROL_PAYLOAD,
};
use nmq_snowflake::{SnowId, SnowNode};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Close status sent before dropping a connection for a protocol violation.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Upper bound on delivering the Close frame during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listener network: `tcp`, `tcp4` or `tcp6`.
    pub network: String,
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Upper bound on a single socket read.
    pub read_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
    /// Largest assembled message.
    pub max_message_size: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("network", &self.network)
            .field("bind_addr", &self.bind_addr)
            .field("read_timeout", &self.read_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            read_timeout: Duration::from_millis(10),
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            metrics: None,
        }
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            network: config.network.clone(),
            bind_addr: config.bind_addr,
            read_timeout: config.read_timeout(),
            max_connections: config.max_connections,
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Listener network family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6, whichever the address is.
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    /// Checks that `addr` belongs to this network.
    pub fn check(self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let ok = match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        };
        if !ok {
            return Err(ServerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address {} does not belong to network {}", addr, self),
            )));
        }
        Ok(addr)
    }
}

impl FromStr for Network {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(ServerError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    /// Bound, accept loop not yet running.
    Listening,
    Accepting,
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub frames_total: AtomicU64,
    pub messages_total: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// State shared by the accept task and every connection task.
struct Shared {
    config: ServerConfig,
    registry: Arc<Registry>,
    generator: Arc<SnowNode>,
    handler: Arc<dyn MessageHandler>,
    stats: ServerStats,
    state: Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
}

/// Connection server.
///
/// Accepts connections, gives each a snowflake id, keeps it in the registry
/// and runs one read loop task per connection.
pub struct Server {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server.
    pub fn new(
        config: ServerConfig,
        registry: Arc<Registry>,
        generator: Arc<SnowNode>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                generator,
                handler,
                stats: ServerStats::default(),
                state: Mutex::new(ServerState::Stopped),
                shutdown,
            }),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Returns the bound address as soon as the listener is up; it does not
    /// wait for the first accept.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        {
            let mut state = self.shared.state.lock();
            if *state != ServerState::Stopped {
                return Err(ServerError::AlreadyRunning);
            }
            *state = ServerState::Listening;
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.shared.state.lock() = ServerState::Stopped;
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                *self.shared.state.lock() = ServerState::Stopped;
                return Err(e.into());
            }
        };

        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(self.shared.clone(), listener, shutdown));
        *self.accept_task.lock() = Some(task);
        *self.local_addr.lock() = Some(local_addr);

        tracing::info!(
            "Server listening on {} ({})",
            local_addr,
            self.shared.config.network
        );
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let network: Network = self.shared.config.network.parse()?;
        let addr = network.check(self.shared.config.bind_addr)?;
        Ok(TcpListener::bind(addr).await?)
    }

    /// Signals the accept loop and every read loop to stop, and closes all
    /// registered connections.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.state() == ServerState::Stopped && self.accept_task.lock().is_none() {
            return Err(ServerError::NotRunning);
        }
        tracing::info!("Stopping server");
        self.shared.shutdown.send_replace(true);
        self.shared.registry.close_all();
        Ok(())
    }

    /// Waits for the accept loop to finish.
    pub async fn join(&self) -> Result<(), ServerError> {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|e| ServerError::Io(io::Error::other(e)))?;
        }
        Ok(())
    }

    /// Serves an already-connected stream as if it had been accepted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<S>(&self, stream: S, peer: Option<SocketAddr>) -> Result<SnowId, ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        attach(&self.shared, stream, peer)
    }

    /// Sends one frame to a live connection.
    pub async fn send(&self, id: SnowId, opcode: OpCode, payload: &[u8]) -> Result<(), ServerError> {
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::InvalidControlFrame("payload exceeds 125 bytes").into());
        }
        let handle = self
            .shared
            .registry
            .lookup(id)
            .ok_or(ServerError::ConnectionNotFound(id))?;
        handle.send(opcode, payload).await
    }

    /// Tears down one connection; its read loop exits and reports the disconnect.
    pub fn close_connection(&self, id: SnowId) -> Result<(), ServerError> {
        self.shared
            .registry
            .unregister(id)
            .map(|_| ())
            .ok_or(ServerError::ConnectionNotFound(id))
    }

    /// Returns a receiver that turns `true` once [`Server::stop`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    /// Returns whether the accept loop is live.
    pub fn is_running(&self) -> bool {
        self.state() != ServerState::Stopped
    }

    /// Returns the bound address of the last successful [`Server::start`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn generator(&self) -> &Arc<SnowNode> {
        &self.shared.generator
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    {
        let mut state = shared.state.lock();
        if *state == ServerState::Listening {
            *state = ServerState::Accepting;
        }
    }

    let stopped = loop {
        tokio::select! {
            biased;

            _ = cancelled(&mut shutdown) => {
                tracing::info!("Server shutting down");
                break true;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                        }
                        if let Err(e) = attach(&shared, stream, Some(addr)) {
                            tracing::warn!("Rejected connection from {}: {}", addr, e);
                        }
                    }
                    Err(e) if is_timeout(&e) => {
                        tracing::warn!("Accept timeout: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        if let Some(ref metrics) = shared.config.metrics {
                            metrics.accept_errors_total.inc();
                        }
                        break false;
                    }
                }
            }
        }
    };

    drop(listener);
    if stopped {
        // connections accepted while stop() was draining
        shared.registry.close_all();
    }
    *shared.state.lock() = ServerState::Stopped;
}

fn attach<S>(shared: &Arc<Shared>, stream: S, peer: Option<SocketAddr>) -> Result<SnowId, ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if *shared.shutdown.borrow() {
        return Err(ServerError::ShuttingDown);
    }

    let max = shared.config.max_connections;
    if shared.registry.len() >= max {
        shared
            .stats
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
        return Err(ServerError::ConnectionLimitReached { max });
    }

    let id = shared.generator.generate()?;
    let (handle, reader) = ConnectionHandle::new(id, peer, stream);
    let handle = Arc::new(handle);
    shared.registry.register(handle.clone())?;

    if *shared.shutdown.borrow() {
        shared.registry.unregister(id);
        return Err(ServerError::ShuttingDown);
    }

    shared
        .stats
        .connections_total
        .fetch_add(1, Ordering::Relaxed);
    shared
        .stats
        .connections_active
        .fetch_add(1, Ordering::Relaxed);
    if let Some(ref metrics) = shared.config.metrics {
        metrics.connections_total.inc();
        metrics.connections_active.inc();
    }

    shared.handler.on_connect(id, peer);

    let shutdown = shared.shutdown.subscribe();
    tokio::spawn(run_connection(shared.clone(), handle, reader, shutdown));
    Ok(id)
}

/// Read loop for one connection. Owns the connection's teardown.
async fn run_connection(
    shared: Arc<Shared>,
    handle: Arc<ConnectionHandle>,
    mut reader: ConnectionReader,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = handle.id();
    let read_timeout = shared.config.read_timeout;
    let mut decoder = Decoder::with_max_frame_size(shared.config.max_frame_size);
    let mut assembler = MessageAssembler::new(shared.config.max_message_size);
    let mut buf = vec![0u8; 8192];
    let mut total_received: u64 = 0;

    let result: Result<(), ServerError> = loop {
        let read = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => {
                tracing::debug!("[{}] Shutdown signal received", id);
                break Ok(());
            }
            _ = handle.closed() => {
                tracing::debug!("[{}] Connection closed locally", id);
                break Ok(());
            }
            read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => read,
        };

        let n = match read {
            // bounded read expired; poll the shutdown flag again
            Err(_) => continue,
            Ok(Ok(0)) => {
                tracing::debug!("[{}] Connection closed by client", id);
                break Ok(());
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_timeout(&e) => continue,
            Ok(Err(e)) => break Err(ServerError::Io(e)),
        };

        total_received += n as u64;
        shared
            .stats
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        if let Some(ref metrics) = shared.config.metrics {
            metrics.bytes_received_total.inc_by(n as f64);
        }
        decoder.extend(&buf[..n]);

        // replies can stall on a peer that stops reading
        let processed = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => {
                tracing::debug!("[{}] Shutdown signal received while dispatching", id);
                break Ok(());
            }
            processed = process_frames(&shared, &handle, &mut decoder, &mut assembler) => processed,
        };

        match processed {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(()) => {}
        Err(ServerError::Protocol(ref e)) => {
            tracing::warn!("[{}] Protocol error: {}", id, e);
            shared
                .stats
                .protocol_errors
                .fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = shared.config.metrics {
                metrics.protocol_errors_total.inc();
            }
            let close_payload = CLOSE_PROTOCOL_ERROR.to_be_bytes();
            let close = handle.send(OpCode::Close, &close_payload);
            match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("[{}] Failed to send close: {}", id, e),
                Err(_) => tracing::debug!("[{}] Close frame timed out", id),
            }
        }
        Err(ServerError::ConnectionClosed) => {
            tracing::debug!("[{}] Closed while replying", id);
        }
        Err(ref e) => {
            tracing::warn!("[{}] Connection error: {}", id, e);
        }
    }

    shared.registry.unregister(id);
    handle.close();
    handle.shutdown_writer().await;

    shared
        .stats
        .connections_active
        .fetch_sub(1, Ordering::Relaxed);
    if let Some(ref metrics) = shared.config.metrics {
        metrics.connections_active.dec();
    }

    shared.handler.on_disconnect(id);
    tracing::info!(
        "[{}] Connection finished, {} bytes received",
        id,
        total_received
    );
}

/// Dispatches every complete frame in the decoder.
///
/// Returns `Ok(false)` once the peer has asked to close.
async fn process_frames(
    shared: &Shared,
    handle: &ConnectionHandle,
    decoder: &mut Decoder,
    assembler: &mut MessageAssembler,
) -> Result<bool, ServerError> {
    while let Some(frame) = decoder.decode_frame()? {
        let opcode = frame.opcode();
        shared.stats.frames_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = shared.config.metrics {
            metrics
                .frames_received_total
                .with_label_values(&[opcode.as_str()])
                .inc();
        }

        match opcode {
            OpCode::Ping => {
                tracing::trace!("[{}] Ping ({} bytes)", handle.id(), frame.payload.len());
                handle.send(OpCode::Pong, &frame.payload).await?;
            }
            OpCode::Pong => {}
            OpCode::Close => {
                tracing::debug!("[{}] Close requested by client", handle.id());
                // echo the status code, if any
                let status = frame.payload.get(..2).unwrap_or_default();
                match tokio::time::timeout(CLOSE_TIMEOUT, handle.send(OpCode::Close, status)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("[{}] Failed to send close: {}", handle.id(), e)
                    }
                    Err(_) => tracing::debug!("[{}] Close frame timed out", handle.id()),
                }
                return Ok(false);
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if let Some((opcode, data)) = assembler.push(frame)? {
                    let message_id = shared.generator.generate()?;
                    let message = Message::new(data).with_id(message_id.to_string());
                    tracing::debug!(
                        "[{}] Message {} ({} bytes)",
                        handle.id(),
                        message.id,
                        message.len()
                    );
                    shared
                        .stats
                        .messages_total
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(ref metrics) = shared.config.metrics {
                        metrics.messages_total.inc();
                    }
                    shared.handler.on_message(handle.id(), opcode, message);
                }
            }
        }
    }
    Ok(true)
}
