//! WebSocket transport for the session engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── SessionRegistry ── Session (file_id)
//!            ├── SyncServer ── Router
//! Client B ──┘        ▲            └── PersistenceGateway (RocksDB)
//!                     │
//!                 TopicHub ── /topic/file/{id} ──► every subscriber
//! ```
//!
//! Each connection is one task. Subscriptions are forwarded into a
//! per-connection outbound queue, which the task drains alongside incoming
//! WebSocket messages. When a connection ends, every file it opened and did
//! not close is closed on its behalf, flushing content to persistence.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::TopicHub;
use crate::protocol::{parse_topic, ClientCommand, Destination, EventKind, FrameError, ServerMessage};
use crate::registry::SessionRegistry;
use crate::router::{Router, RouterError, ShutdownReport};
use crate::runner::CodeRunner;
use crate::session::FileId;
use crate::storage::{MemoryStore, PersistenceError, PersistenceGateway, RocksStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per subscriber before it starts lagging
    pub topic_capacity: usize,
    /// RocksDB directory (None = in-memory only). Only read by
    /// [`SyncServer::new`]; [`SyncServer::with_router`] uses the router's store.
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            topic_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_commands: u64,
    pub rejected_commands: u64,
    /// Live sessions in the registry, sampled by [`SyncServer::stats`]
    pub open_sessions: usize,
    /// Topics with at least one past subscriber, sampled by [`SyncServer::stats`]
    pub active_topics: usize,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("storage error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Everything a connection task needs, shared across connections.
#[derive(Clone)]
struct Shared {
    router: Arc<Router>,
    runner: Option<Arc<CodeRunner>>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
}

impl SyncServer {
    /// Build a server with its own registry, topics and store.
    ///
    /// Uses a [`RocksStore`] when `storage_path` is set, otherwise a
    /// [`MemoryStore`].
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn PersistenceGateway> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let router = Arc::new(Router::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(TopicHub::new(config.topic_capacity)),
            store,
        ));
        Ok(Self::with_router(config, router))
    }

    /// Build a server around an existing router.
    pub fn with_router(config: ServerConfig, router: Arc<Router>) -> Self {
        Self {
            config,
            shared: Shared {
                router,
                runner: None,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Enable `run` commands.
    pub fn with_runner(mut self, runner: Arc<CodeRunner>) -> Self {
        self.shared.runner = Some(runner);
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves, then flush every open session.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<ShutdownReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tokio::select! {
            result = self.serve(listener) => result?,
            _ = shutdown => log::info!("Shutdown requested"),
        }
        Ok(self.shared.router.shutdown().await)
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();

        log::info!("WebSocket connection {conn_id} established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::new(conn_id, shared.clone());
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = conn.handle_text(text.as_str()).await {
                                shared.stats.write().await.rejected_commands += 1;
                                log::warn!("Rejected command from {addr}: {e}");
                                conn.reply(ServerMessage::Error { message: e.to_string() });
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            conn.reply(ServerMessage::Error {
                                message: "binary messages are not supported".to_string(),
                            });
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Err(e.into());
                        }
                    }
                }

                Some(outgoing) = conn.outbound_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::Text(outgoing.into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        conn.finish().await;
        shared.stats.write().await.active_connections -= 1;
        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.open_sessions = self.shared.router.registry().len().await;
        stats.active_topics = self.shared.router.topics().topic_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }
}

/// Per-connection state.
struct Connection {
    id: Uuid,
    shared: Shared,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Forwarding task per subscribed file
    subscriptions: HashMap<FileId, JoinHandle<()>>,
    /// Files opened here and not yet closed
    opened: HashSet<FileId>,
}

impl Connection {
    fn new(id: Uuid, shared: Shared) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id,
            shared,
            outbound_tx,
            outbound_rx,
            subscriptions: HashMap::new(),
            opened: HashSet::new(),
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), ServerError> {
        self.shared.stats.write().await.total_commands += 1;

        match ClientCommand::decode(text)? {
            ClientCommand::Subscribe { topic } => {
                let file_id = Self::topic_id(&topic)?;
                if !self.subscriptions.contains_key(&file_id) {
                    let rx = self.shared.router.topics().subscribe(file_id).await;
                    let task = Self::forward(file_id, rx, self.outbound_tx.clone());
                    self.subscriptions.insert(file_id, task);
                    log::debug!("Connection {} subscribed to {topic}", self.id);
                }
            }
            ClientCommand::Unsubscribe { topic } => {
                let file_id = Self::topic_id(&topic)?;
                if let Some(task) = self.subscriptions.remove(&file_id) {
                    task.abort();
                }
            }
            ClientCommand::Send { destination, body } => {
                let destination = Destination::parse(&destination)?;
                let file_id = destination.file_id;
                self.shared.router.dispatch(destination, body.as_bytes()).await?;
                match destination.kind {
                    EventKind::Open | EventKind::Edit => {
                        self.opened.insert(file_id);
                    }
                    EventKind::Close => {
                        self.opened.remove(&file_id);
                    }
                }
            }
            ClientCommand::Run { file_id, extension } => self.spawn_run(file_id, extension)?,
        }
        Ok(())
    }

    fn spawn_run(&self, file_id: FileId, extension: String) -> Result<(), ServerError> {
        let Some(runner) = self.shared.runner.clone() else {
            self.reply(ServerMessage::RunFailed {
                file_id,
                reason: "disabled".to_string(),
                message: "code execution is not enabled on this server".to_string(),
            });
            return Ok(());
        };

        let outbound = self.outbound_tx.clone();
        tokio::spawn(async move {
            let reply = match runner.run(file_id, &extension).await {
                Ok(output) => ServerMessage::RunResult { file_id, output },
                Err(e) => {
                    log::warn!("Run of file {file_id} failed: {e}");
                    ServerMessage::RunFailed {
                        file_id,
                        reason: e.kind().to_string(),
                        message: e.to_string(),
                    }
                }
            };
            if let Ok(text) = reply.encode() {
                let _ = outbound.send(text);
            }
        });
        Ok(())
    }

    /// Queue a message for this connection only.
    fn reply(&self, msg: ServerMessage) {
        match msg.encode() {
            Ok(text) => {
                let _ = self.outbound_tx.send(text);
            }
            Err(e) => log::error!("Failed to encode reply: {e}"),
        }
    }

    /// Copy frames from a topic into the outbound queue until either side goes away.
    fn forward(
        file_id: FileId,
        mut rx: broadcast::Receiver<crate::protocol::Frame>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let Ok(text) = ServerMessage::from_frame(file_id, &frame).encode() else {
                            continue;
                        };
                        if outbound.send(text).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Subscriber of file {file_id} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn topic_id(topic: &str) -> Result<FileId, ServerError> {
        parse_topic(topic).ok_or_else(|| FrameError::UnknownDestination(topic.to_string()).into())
    }

    /// Tear down subscriptions and close files left open.
    async fn finish(mut self) {
        for (file_id, task) in self.subscriptions.drain() {
            task.abort();
            self.shared.router.topics().prune(file_id).await;
        }
        for file_id in self.opened.drain() {
            if let Err(e) = self.shared.router.close(file_id).await {
                log::error!("Failed to close file {file_id} for connection {}: {e}", self.id);
            }
        }
    }
}
