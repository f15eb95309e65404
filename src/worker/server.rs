//! Render Server
//!
//! Lifecycle of one slave process: `Unstarted → Ready ⇄ Busy → Stopped`.
//! Listeners and connections only share state through the `SessionSlot` mutex,
//! so a `ServerConnect` arriving on both address families at once is settled by
//! whichever task takes the lock first; the other one answers `BUSY`.

use super::handlers::{CommandRegistry, Connection};
use super::types::{Flow, ServerState, SessionId, SessionSlot};
use crate::config::ServerConfig;
use crate::context::RenderContext;
use crate::wire::codec::Wire;
use crate::wire::protocol::SERVER_VERSION_STRING;

use anyhow::{Result, bail};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Any bidirectional byte stream a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub struct RenderServer {
    pub(crate) config: ServerConfig,
    pub(crate) ctx: RenderContext,
    pub(crate) slot: Mutex<SessionSlot>,
    handlers: CommandRegistry,
    port: AtomicU16,
    local_addrs: std::sync::Mutex<Vec<SocketAddr>>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl RenderServer {
    pub fn new(config: ServerConfig, ctx: RenderContext) -> Arc<Self> {
        Self::with_registry(config, ctx, CommandRegistry::with_default_handlers())
    }

    /// Uses a caller-supplied command table instead of the default one.
    pub fn with_registry(
        config: ServerConfig,
        ctx: RenderContext,
        handlers: CommandRegistry,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            port: AtomicU16::new(config.tcp_port),
            config,
            ctx,
            slot: Mutex::new(SessionSlot::new()),
            handlers,
            local_addrs: std::sync::Mutex::new(Vec::new()),
            listeners: std::sync::Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn handlers(&self) -> &CommandRegistry {
        &self.handlers
    }

    /// Port actually listened on (resolved when configured as 0).
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn state(&self) -> ServerState {
        self.slot.lock().await.state
    }

    pub async fn current_session(&self) -> Option<SessionId> {
        self.slot.lock().await.sid
    }

    /// Binds the IPv4 and IPv6 listeners and starts accepting connections.
    ///
    /// A family that cannot be bound is logged and skipped; failing both is an error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let slot = self.slot.lock().await;
            if slot.state != ServerState::Unstarted {
                tracing::error!("Can not start a rendering server in state: {:?}", slot.state);
                bail!("server already started ({:?})", slot.state);
            }
        }

        tracing::info!(
            "Launching server mode [{} threads]",
            self.config.thread_count
        );
        tracing::debug!("Server version {}", SERVER_VERSION_STRING);
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "unable to create work dir '{}': {}",
                    self.config.work_dir.display(),
                    e
                )
            })?;

        let mut port = self.config.tcp_port;
        let mut listeners = Vec::new();
        let families: [(&str, Option<IpAddr>); 2] = [
            ("IPv4", self.config.bind_ipv4.map(IpAddr::V4)),
            ("IPv6", self.config.bind_ipv6.map(IpAddr::V6)),
        ];
        for (family, addr) in families {
            let Some(addr) = addr else {
                continue;
            };
            match TcpListener::bind((addr, port)).await {
                Ok(listener) => {
                    if let Ok(local) = listener.local_addr() {
                        // The second family must share the port the first one resolved.
                        port = local.port();
                        tracing::info!("Server listening on {}", local);
                    }
                    listeners.push(listener);
                }
                Err(e) => tracing::info!("{} not available on port {}: {}", family, port, e),
            }
        }
        if listeners.is_empty() {
            bail!("unable to listen on port {}", self.config.tcp_port);
        }

        self.port.store(port, Ordering::Relaxed);
        *self.local_addrs.lock().unwrap_or_else(PoisonError::into_inner) = listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect();
        self.slot.lock().await.state = ServerState::Ready;

        {
            let mut handles = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            for listener in listeners {
                let server = self.clone();
                let shutdown = self.shutdown.subscribe();
                handles.push(tokio::spawn(server.accept_loop(listener, shutdown)));
            }
        }

        tracing::info!("Server ready on port {}", port);
        Ok(())
    }

    /// Stops accepting connections and aborts an ongoing session.
    pub async fn stop(&self) {
        let was_busy = {
            let mut slot = self.slot.lock().await;
            match slot.state {
                ServerState::Ready | ServerState::Busy => {
                    let busy = slot.state == ServerState::Busy;
                    slot.state = ServerState::Stopped;
                    busy
                }
                other => {
                    tracing::error!("Can not stop a rendering server in state: {:?}", other);
                    return;
                }
            }
        };

        self.shutdown.send_replace(true);
        self.join().await;
        if was_busy {
            self.cleanup_session().await;
        } else {
            let stale = std::mem::take(&mut self.slot.lock().await.temp_files);
            remove_files(stale).await;
        }
        tracing::info!("Server stopped");
    }

    /// Waits for every accept loop to exit.
    pub async fn join(&self) {
        let handles =
            std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Listener task ended abnormally: {}", e);
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("Unable to disable Nagle for {}: {}", peer, e);
                        }
                        tracing::debug!("Accepted connection from {}", peer);
                        tokio::spawn(self.clone().serve_connection(stream, peer.to_string()));
                    }
                    Err(e) => {
                        tracing::warn!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Runs the command loop for one connection until the peer closes it,
    /// a handler closes it, or a handler fails.
    ///
    /// A failure ends the active session: the render is aborted and the session's
    /// received files are deleted.
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let mut conn = Connection {
            server: self.clone(),
            wire: Wire::new(stream),
            peer,
        };

        loop {
            let command = match conn.wire.next_line().await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Connection from {} lost: {}", conn.peer, e);
                    break;
                }
            };
            let command = command.trim();
            if command.is_empty() {
                continue;
            }

            tracing::debug!("Processing command '{}' from {}", command, conn.peer);
            let result = match self.handlers.get(command) {
                Some(handler) => handler(&mut conn, command).await,
                None => Err(super::types::SessionError::UnknownCommand(command.to_string())),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    tracing::error!(
                        severe = true,
                        "Error processing command '{}': {}",
                        command,
                        e
                    );
                    tracing::info!("Ending session, cleaning up");
                    self.cleanup_session().await;
                    break;
                }
            }
        }

        if let Err(e) = conn.wire.shutdown().await {
            tracing::debug!("Error closing connection from {}: {}", conn.peer, e);
        }
    }

    // --- Session bookkeeping ---

    /// `Ready → Busy` with a fresh session ID, or `None` if a session is active.
    /// Files received outside any session are deleted.
    pub(crate) async fn begin_session(&self) -> Option<SessionId> {
        let (sid, stale) = {
            let mut slot = self.slot.lock().await;
            if slot.state != ServerState::Ready {
                return None;
            }
            let sid = SessionId::new();
            slot.state = ServerState::Busy;
            slot.sid = Some(sid);
            slot.received.clear();
            (sid, std::mem::take(&mut slot.temp_files))
        };
        remove_files(stale).await;
        Some(sid)
    }

    /// Undoes `begin_session` after a failed handshake.
    pub(crate) async fn abandon_session(&self, sid: SessionId) {
        let mut slot = self.slot.lock().await;
        if slot.sid == Some(sid) {
            slot.sid = None;
            if slot.state == ServerState::Busy {
                slot.state = ServerState::Ready;
            }
        }
    }

    pub(crate) async fn session_matches(&self, presented: &str) -> bool {
        let slot = self.slot.lock().await;
        slot.state == ServerState::Busy
            && slot.sid.is_some()
            && SessionId::parse(presented) == slot.sid
    }

    /// Aborts the render, deletes the session's files and returns to `Ready`.
    pub(crate) async fn cleanup_session(&self) {
        self.ctx.target().lock().await.abort();

        let files = {
            let mut slot = self.slot.lock().await;
            slot.sid = None;
            slot.received.clear();
            if slot.state == ServerState::Busy {
                slot.state = ServerState::Ready;
            }
            std::mem::take(&mut slot.temp_files)
        };

        remove_files(files).await;
        tracing::info!("Server ready");
    }

    pub(crate) async fn cached_file(&self, hash: &str) -> Option<PathBuf> {
        self.slot.lock().await.received.get(hash).cloned()
    }

    pub(crate) async fn track_file(&self, path: &Path) {
        let mut slot = self.slot.lock().await;
        if !slot.temp_files.iter().any(|p| p == path) {
            slot.temp_files.push(path.to_path_buf());
        }
    }

    pub(crate) async fn mark_received(&self, hash: &str, path: &Path) {
        self.slot
            .lock()
            .await
            .received
            .insert(hash.to_string(), path.to_path_buf());
    }

    /// `<work_dir>/<prefix>_<port>.flm`
    pub(crate) fn flm_path(&self, prefix: &str) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{}_{:05}.flm", prefix, self.port()))
    }
}

async fn remove_files(files: Vec<PathBuf>) {
    for file in files {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => tracing::debug!("Removed '{}'", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Error removing file '{}': {}", file.display(), e),
        }
    }
}
