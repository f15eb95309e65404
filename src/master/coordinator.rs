//! Coordinator
//!
//! Owns the roster of slaves and every conversation with them. Each public
//! operation takes the state mutex for its whole duration, so a periodic film
//! update never overlaps a foreground connect or flush.

use super::commands::CommandLog;
use super::files::FileRegistry;
use super::types::{MapCache, MapKind, ReconnectStatus, ServerStatus, WorkerSession};
use crate::config::FarmConfig;
use crate::context::RenderContext;
use crate::logging::{LogRecord, Severity};
use crate::wire::codec::{MAP_COMPRESSION, Wire, compress, encode_floats};
use crate::wire::commands::{CommandArgs, FLUSH_TRIGGER, file_params_for};
use crate::wire::hash::challenge_response;
use crate::wire::protocol::*;

use anyhow::{Result, anyhow, bail};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Everything guarded by the roster mutex.
#[derive(Default)]
struct FarmState {
    servers: Vec<WorkerSession>,
    log: CommandLog,
    files: FileRegistry,
    maps: MapCache,
    done_rendering: bool,
}

pub struct Coordinator {
    ctx: RenderContext,
    state: Mutex<FarmState>,
    polling_interval_secs: AtomicU64,
    default_tcp_port: AtomicU16,
    connect_timeout: Duration,
    slave_count: AtomicUsize,
    updater: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_update: std::sync::Mutex<Instant>,
}

impl Coordinator {
    pub fn new(config: FarmConfig, ctx: RenderContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(FarmState::default()),
            polling_interval_secs: AtomicU64::new(config.polling_interval_secs),
            default_tcp_port: AtomicU16::new(config.default_tcp_port),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            slave_count: AtomicUsize::new(0),
            updater: std::sync::Mutex::new(None),
            last_update: std::sync::Mutex::new(Instant::now()),
        })
    }

    // --- Configuration surface ---

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.load(Ordering::Relaxed))
    }

    /// Takes effect from the next periodic cycle.
    pub fn set_polling_interval(&self, secs: u64) {
        self.polling_interval_secs.store(secs.max(1), Ordering::Relaxed);
    }

    pub fn default_tcp_port(&self) -> u16 {
        self.default_tcp_port.load(Ordering::Relaxed)
    }

    pub fn set_default_tcp_port(&self, port: u16) {
        self.default_tcp_port.store(port, Ordering::Relaxed);
    }

    pub fn slave_node_count(&self) -> usize {
        self.slave_count.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    /// Seconds until the periodic task pulls film again, 0 when it is not running.
    pub fn update_time_remaining(&self) -> u64 {
        if !self.updater_running() {
            return 0;
        }
        let last = *self.last_update.lock().unwrap_or_else(PoisonError::into_inner);
        self.polling_interval()
            .saturating_sub(last.elapsed())
            .as_secs()
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        let state = self.state.lock().await;
        state.servers.iter().map(WorkerSession::status).collect()
    }

    /// Splits `host[:port]`. A trailing `::` group of an IPv6 literal is not a port.
    pub fn decode_server_name(&self, server_name: &str) -> Option<(String, u16)> {
        let default_port = self.default_tcp_port();
        let name = server_name.trim();
        if name.is_empty() {
            return None;
        }

        let port_sep = name.rfind(':');
        let ipv6_sep = name.rfind("::");
        let (host, port) = match port_sep {
            Some(i) if ipv6_sep.is_none_or(|v| i != v + 1) && !is_bare_ipv6(name) => {
                let port = match name[i + 1..].parse::<u16>() {
                    Ok(port) => port,
                    Err(_) => {
                        tracing::error!("Invalid port in server name '{}'", server_name);
                        return None;
                    }
                };
                (&name[..i], port)
            }
            _ => (name, default_port),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some((host.to_string(), port))
    }

    // --- Roster operations ---

    /// Opens a session on `server_name`. Returns `false` when the slave refuses,
    /// is unreachable or is already connected.
    pub async fn connect(self: &Arc<Self>, server_name: &str) -> bool {
        let Some((host, port)) = self.decode_server_name(server_name) else {
            return false;
        };

        let mut state = self.state.lock().await;
        if state
            .servers
            .iter()
            .any(|s| s.active && s.same_server(&host, port))
        {
            tracing::warn!("Server {}:{} is already connected", host, port);
            return false;
        }

        tracing::info!("Connecting server: {}:{}", host, port);
        let mut session = WorkerSession::new(&host, port);
        if let Err(e) = self.handshake(&mut session).await {
            tracing::error!("Unable to connect server {}: {:#}", session.address(), e);
            return false;
        }

        state.servers.retain(|s| !s.same_server(&host, port));
        state.servers.push(session);
        self.slave_count.store(state.servers.len(), Ordering::Relaxed);

        if state.log.is_complete() {
            self.flush_locked(&mut state).await;
        }
        drop(state);

        self.start_updater();
        true
    }

    pub async fn disconnect(&self, server_name: &str) {
        let Some((host, port)) = self.decode_server_name(server_name) else {
            return;
        };

        let mut state = self.state.lock().await;
        let Some(index) = state.servers.iter().position(|s| s.same_server(&host, port)) else {
            tracing::warn!("Server {}:{} is not in the roster", host, port);
            return;
        };

        let session = state.servers.remove(index);
        self.notify_disconnect(&session).await;
        self.slave_count.store(state.servers.len(), Ordering::Relaxed);
        if state.servers.is_empty() {
            self.stop_updater();
        }
    }

    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        for session in std::mem::take(&mut state.servers) {
            self.notify_disconnect(&session).await;
        }
        self.slave_count.store(0, Ordering::Relaxed);
        self.stop_updater();
    }

    /// Recovers the existing session if possible, otherwise forces the slave idle
    /// through the password challenge.
    pub async fn reset(&self, server_name: &str, password: &str) -> bool {
        let Some((host, port)) = self.decode_server_name(server_name) else {
            return false;
        };

        let mut state = self.state.lock().await;
        if let Some(index) = state.servers.iter().position(|s| s.same_server(&host, port)) {
            tracing::debug!("Attempting to recover session on {}:{}", host, port);
            let FarmState { servers, maps, .. } = &mut *state;
            if self.reconnect(&mut servers[index], maps).await == ReconnectStatus::Success {
                tracing::info!("Reconnected to {}:{}, reset not needed", host, port);
                return true;
            }
            state.servers.remove(index);
            self.slave_count.store(state.servers.len(), Ordering::Relaxed);
        }

        match self.challenge_reset(&host, port, password).await {
            Ok(true) => {
                tracing::info!("Server {}:{} is idle", host, port);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!("Unable to reset server {}:{}: {:#}", host, port, e);
                false
            }
        }
    }

    /// Replays the command log to every active slave that has not received it yet.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;
    }

    pub async fn reconnect_failed(&self) {
        let mut state = self.state.lock().await;
        self.reconnect_failed_locked(&mut state).await;
    }

    /// Pulls and merges film samples from every active slave.
    /// Returns the number of samples merged.
    pub async fn update_film(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.reconnect_failed_locked(&mut state).await;

        let mut total = 0.0;
        for session in state.servers.iter_mut().filter(|s| s.active) {
            tracing::info!("Getting samples from: {}", session.address());
            match self.fetch_film(session).await {
                Ok(samples) => total += samples,
                Err(e) => {
                    tracing::error!(
                        "Error while communicating with server {}: {:#}",
                        session.address(),
                        e
                    );
                    session.active = false;
                    session.samples_per_second = 0.0;
                }
            }
        }

        self.reconnect_failed_locked(&mut state).await;
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        total
    }

    /// Pulls buffered diagnostics from every active slave and re-emits them locally.
    pub async fn update_log(&self) {
        let mut state = self.state.lock().await;
        self.reconnect_failed_locked(&mut state).await;

        for session in state.servers.iter_mut().filter(|s| s.active) {
            if let Err(e) = self.fetch_log(session).await {
                tracing::error!(
                    "Error while getting log from server {}: {:#}",
                    session.address(),
                    e
                );
                session.active = false;
            }
        }

        self.reconnect_failed_locked(&mut state).await;
    }

    /// Sends a guidance map to every active slave, outside the command log.
    pub async fn push_map(&self, kind: MapKind, size_hint: usize, map: Vec<f32>) -> Result<()> {
        if size_hint != map.len() {
            bail!(
                "{} carries {} values, expected {}",
                kind.command(),
                map.len(),
                size_hint
            );
        }

        let mut state = self.state.lock().await;
        self.reconnect_failed_locked(&mut state).await;

        for session in state.servers.iter_mut().filter(|s| s.active) {
            self.send_map(session, kind, &map).await;
        }
        state.maps.set(kind, map);

        self.reconnect_failed_locked(&mut state).await;
        Ok(())
    }

    /// Compiles one scene API call into the log; the flush trigger replays the log.
    pub async fn send(&self, name: &str, args: CommandArgs) -> Result<()> {
        let mut state = self.state.lock().await;
        let FarmState { log, files, .. } = &mut *state;
        if let Err(e) = log.append(files, name, &args, file_params_for(name)) {
            tracing::error!("Unable to compile command '{}': {:#}", name, e);
            return Err(e);
        }

        if name == FLUSH_TRIGGER {
            tracing::info!("Scene complete, sending commands to slaves");
            state.done_rendering = false;
            self.flush_locked(&mut state).await;
        }
        Ok(())
    }

    /// Starts periodic film updates if slaves are connected.
    pub fn start(self: &Arc<Self>) {
        if self.slave_node_count() > 0 {
            self.start_updater();
        }
    }

    pub async fn stop(&self) {
        let state = self.state.lock().await;
        if state.done_rendering || state.servers.is_empty() {
            self.stop_updater();
        }
    }

    /// The render is over: the next scene starts from an incomplete log.
    pub async fn rendering_done(&self) {
        let mut state = self.state.lock().await;
        state.log.set_complete(false);
        state.done_rendering = true;
        self.stop_updater();
    }

    /// Files referenced so far and how many bodies have crossed the wire.
    pub async fn file_stats(&self) -> (usize, u64) {
        let state = self.state.lock().await;
        (state.files.len(), state.files.files_sent())
    }

    // --- Periodic task ---

    fn updater_running(&self) -> bool {
        self.updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn start_updater(self: &Arc<Self>) {
        let mut slot = self.updater.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        let farm: Weak<Self> = Arc::downgrade(self);
        tracing::debug!("Starting periodic film updates");
        *slot = Some(tokio::spawn(async move {
            loop {
                let Some(interval) = farm.upgrade().map(|f| f.polling_interval()) else {
                    break;
                };
                tokio::time::sleep(interval).await;

                let Some(farm) = farm.upgrade() else {
                    break;
                };
                if farm.slave_node_count() == 0 {
                    tracing::debug!("No slaves left, stopping periodic film updates");
                    break;
                }
                let samples = farm.update_film().await;
                tracing::debug!("Periodic film update merged {} samples", samples);
            }
        }));
    }

    fn stop_updater(&self) {
        let handle = self
            .updater
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            tracing::debug!("Stopping periodic film updates");
            handle.abort();
        }
    }

    // --- Locked helpers ---

    async fn flush_locked(&self, state: &mut FarmState) {
        let FarmState {
            servers,
            log,
            files,
            maps,
            ..
        } = state;

        for session in servers.iter_mut().filter(|s| s.active && !s.flushed) {
            tracing::info!("Sending commands to server: {}", session.address());
            match self.replay_to(session, log, files).await {
                Ok(()) => {
                    session.flushed = true;
                    session.last_contact = Instant::now();
                    self.push_cached_maps(session, maps).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Error while sending commands to server {}: {:#}",
                        session.address(),
                        e
                    );
                    session.active = false;
                }
            }
        }
        tracing::debug!("All servers are aligned");
    }

    async fn reconnect_failed_locked(&self, state: &mut FarmState) {
        {
            let FarmState { servers, maps, .. } = &mut *state;
            for session in servers.iter_mut().filter(|s| !s.active) {
                tracing::info!("Trying to reconnect server: {}", session.address());
                if self.reconnect(session, maps).await != ReconnectStatus::Rejected {
                    continue;
                }

                tracing::info!(
                    "Server {} rejected the session, opening a new one",
                    session.address()
                );
                if let Err(e) = self.handshake(session).await {
                    tracing::error!("Unable to connect server {}: {:#}", session.address(), e);
                }
            }
        }

        if state.log.is_complete() {
            self.flush_locked(state).await;
        }
    }

    // --- Per-slave exchanges ---

    async fn open(&self, host: &str, port: u16) -> Result<Wire<TcpStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow!("connection to {}:{} timed out", host, port))??;
        stream.set_nodelay(true)?;
        Ok(Wire::new(stream))
    }

    /// `ServerConnect` exchange; on success the session holds a fresh sid and needs a flush.
    async fn handshake(&self, session: &mut WorkerSession) -> Result<()> {
        let mut wire = self.open(&session.host, session.port).await?;
        wire.write_line(CMD_SERVER_CONNECT).await?;

        let result = wire.read_line().await?;
        tracing::info!("Connect result from {}: {}", session.address(), result);
        if result != RESP_OK {
            bail!("server refused the connection: {}", result);
        }

        let version = wire.read_line().await?;
        if !version.contains(PROTOCOL_MARKER) {
            bail!("invalid version string '{}'", version);
        }
        if version != SERVER_VERSION_STRING {
            bail!(
                "version mismatch: server '{}', local '{}'",
                version,
                SERVER_VERSION_STRING
            );
        }

        let sid = wire.read_line().await?;
        wire.write_line(&sid).await?;
        wire.expect_line(RESP_CONNECTED).await?;
        tracing::info!("Server {} session ID: {}", session.address(), sid);

        let now = Instant::now();
        session.sid = sid;
        session.active = true;
        session.flushed = false;
        session.last_contact = now;
        session.last_samples = now;
        session.samples_per_second = 0.0;
        Ok(())
    }

    async fn reconnect(&self, session: &mut WorkerSession, maps: &MapCache) -> ReconnectStatus {
        let result = async {
            let mut wire = self.open(&session.host, session.port).await?;
            wire.write_line(CMD_SERVER_RECONNECT).await?;
            wire.write_line(&session.sid).await?;
            let result = wire.read_line().await?;
            tracing::info!("Reconnect result from {}: {}", session.address(), result);
            Ok::<_, anyhow::Error>(result == RESP_CONNECTED)
        }
        .await;

        match result {
            Ok(true) => {
                session.active = true;
                session.flushed = true;
                session.last_contact = Instant::now();
                session.last_samples = Instant::now();
                self.push_cached_maps(session, maps).await;
                ReconnectStatus::Success
            }
            Ok(false) => {
                session.active = false;
                session.samples_per_second = 0.0;
                ReconnectStatus::Rejected
            }
            Err(e) => {
                tracing::error!("Unable to reconnect server {}: {:#}", session.address(), e);
                session.samples_per_second = 0.0;
                ReconnectStatus::Error
            }
        }
    }

    async fn notify_disconnect(&self, session: &WorkerSession) {
        tracing::info!("Disconnecting server: {}", session.address());
        let result = async {
            let mut wire = self.open(&session.host, session.port).await?;
            wire.write_line(CMD_SERVER_DISCONNECT).await?;
            wire.write_line(&session.sid).await?;
            wire.shutdown().await?;
            tokio::time::timeout(self.connect_timeout, wire.read_to_end())
                .await
                .map_err(|_| anyhow!("slave did not close the connection"))??;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Error while disconnecting server {}: {:#}",
                session.address(),
                e
            );
        }
    }

    /// `true` for `RESET` or `IDLE`, `false` for `DENIED`.
    async fn challenge_reset(&self, host: &str, port: u16, password: &str) -> Result<bool> {
        let mut wire = self.open(host, port).await?;
        wire.write_line(CMD_SERVER_RESET).await?;

        let result = wire.read_line().await?;
        if result == RESP_IDLE {
            return Ok(true);
        }
        if result != RESP_CHALLENGE {
            bail!("unexpected reset response '{}'", result);
        }

        let salt = wire.read_line().await?;
        wire.write_line(&challenge_response(&salt, password)).await?;
        match wire.read_line().await?.as_str() {
            RESP_RESET => Ok(true),
            RESP_DENIED => {
                tracing::error!("Authentication failed resetting {}:{}", host, port);
                Ok(false)
            }
            other => bail!("unexpected reset response '{}'", other),
        }
    }

    /// Replays the whole log on one connection, then waits for the slave to close it,
    /// which happens only after every command has been applied.
    async fn replay_to(
        &self,
        session: &WorkerSession,
        log: &CommandLog,
        files: &mut FileRegistry,
    ) -> Result<()> {
        let mut wire = self.open(&session.host, session.port).await?;
        log.replay(files, &mut wire).await?;
        wire.shutdown().await?;
        wire.read_to_end().await?;
        Ok(())
    }

    async fn fetch_film(&self, session: &mut WorkerSession) -> Result<f64> {
        let mut wire = self.open(&session.host, session.port).await?;
        wire.write_line(CMD_GET_FILM).await?;
        wire.write_line(&session.sid).await?;
        wire.flush().await?;

        let bytes = wire.read_to_end().await?;
        let received_at = Instant::now();
        let samples = self.ctx.target().lock().await.merge_film(&bytes)?;

        if samples > 0.0 {
            let elapsed = received_at.duration_since(session.last_samples).as_secs_f64();
            session.samples_received += samples;
            session.samples_per_second = if elapsed > 0.0 { samples / elapsed } else { 0.0 };
            session.last_samples = received_at;
            tracing::info!(
                "Received {} samples from {} ({} Kbytes)",
                samples,
                session.address(),
                bytes.len() / 1024
            );
        } else {
            tracing::info!("No new samples from {}", session.address());
        }
        session.last_contact = Instant::now();
        Ok(samples)
    }

    async fn fetch_log(&self, session: &mut WorkerSession) -> Result<()> {
        let mut wire = self.open(&session.host, session.port).await?;
        wire.write_line(CMD_GET_LOG).await?;
        wire.write_line(&session.sid).await?;
        wire.flush().await?;

        let bytes = wire.read_to_end().await?;
        let origin = session.address();
        let filter = self.ctx.log_filter();
        let threshold = filter.max(Severity::Warning);

        for line in String::from_utf8_lossy(&bytes).lines() {
            let Some(record) = LogRecord::parse_line(line) else {
                tracing::debug!("Ignoring malformed log line from {}: '{}'", origin, line);
                continue;
            };
            if filter > Severity::Debug && record.severity < threshold {
                continue;
            }
            record.emit(&origin);
        }

        session.last_contact = Instant::now();
        Ok(())
    }

    async fn push_cached_maps(&self, session: &mut WorkerSession, maps: &MapCache) {
        for kind in MapKind::ALL {
            if let Some(map) = maps.get(kind) {
                self.send_map(session, kind, map).await;
            }
        }
    }

    async fn send_map(&self, session: &mut WorkerSession, kind: MapKind, map: &[f32]) {
        let result = async {
            let count = u32::try_from(map.len())?;
            let payload = compress(&encode_floats(map), MAP_COMPRESSION)?;

            let mut wire = self.open(&session.host, session.port).await?;
            wire.write_line(kind.command()).await?;
            wire.write_line(&session.sid).await?;
            wire.write_u32_le(count).await?;
            wire.write_raw(&payload).await?;
            wire.shutdown().await?;
            wire.read_to_end().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => session.last_contact = Instant::now(),
            Err(e) => {
                tracing::error!(
                    "Error while sending {} to server {}: {:#}",
                    kind.command(),
                    session.address(),
                    e
                );
                session.active = false;
            }
        }
    }
}

fn is_bare_ipv6(name: &str) -> bool {
    !name.starts_with('[') && name.matches(':').count() > 1
}
