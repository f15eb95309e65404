//! Command Handler Registry
//!
//! Maps the literal command names read off a connection to the async functions
//! implementing them. Scene commands share one generic handler driven by their
//! argument shape; session and pull commands have dedicated handlers.

use super::server::{BoxedStream, RenderServer};
use super::transfer::receive_files;
use super::types::{Flow, ServerState, SessionError};
use crate::scene::film::write_atomically;
use crate::wire::codec::{Wire, decode_floats, decompress};
use crate::wire::commands::{CommandArgs, SCENE_COMMANDS, SceneCommand, read_args, shape_of};
use crate::wire::hash::challenge_response;
use crate::wire::protocol::*;

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type HandlerResult = Result<Flow, SessionError>;

/// Handler signature: the connection it runs on and the command name that selected it.
pub type CommandHandlerFn = for<'a> fn(&'a mut Connection, &'a str) -> BoxFuture<'a, HandlerResult>;

/// Film outputs a slave must never write itself.
const FILM_OUTPUT_FLAGS: &[&str] = &[
    "write_exr",
    "write_exr_ZBuf",
    "write_png",
    "write_png_ZBuf",
    "write_tga",
    "write_tga_ZBuf",
    "write_resume_flm",
];
/// Halt conditions are decided by the master.
const FILM_HALT_PARAMS: &[&str] = &["haltspp", "halttime", "haltthreshold"];
const SUPPORTED_FILMS: &[&str] = &["fleximage", "multiimage"];

/// One accepted connection.
pub struct Connection {
    pub(crate) server: Arc<RenderServer>,
    pub(crate) wire: Wire<BoxedStream>,
    pub(crate) peer: String,
}

impl Connection {
    /// Reads the presented session ID and checks it against the active session.
    /// A peer that closes before presenting one is refused like a wrong ID.
    async fn validate_access(&mut self) -> bool {
        match self.wire.read_line().await {
            Ok(presented) => self.server.session_matches(&presented).await,
            Err(e) => {
                tracing::debug!("No session ID from {}: {}", self.peer, e);
                false
            }
        }
    }

    /// Applies a decoded command to the render target. Failures are logged only.
    async fn apply(&mut self, command: SceneCommand) -> bool {
        let name = command.name.clone();
        let result = self.server.ctx.target().lock().await.apply(command);
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error applying '{}': {:#}", name, e);
                false
            }
        }
    }

    /// Logs why a privileged command was refused.
    async fn refuse(&mut self, command: &str) {
        if self.server.state().await == ServerState::Busy {
            tracing::error!("Unknown session ID for '{}' from {}", command, self.peer);
        } else {
            tracing::error!("Received a {} command without an active session", command);
        }
    }
}

/// Registry holding the mapping between command names and their handlers.
pub struct CommandRegistry {
    handlers: DashMap<String, CommandHandlerFn>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// The full command table of a rendering slave.
    pub fn with_default_handlers() -> Self {
        let registry = Self::new();
        for (name, _) in SCENE_COMMANDS {
            registry.register(name, handle_scene_command);
        }
        registry.register("luxFilm", handle_film);
        registry.register("luxWorldEnd", handle_world_end);
        registry.register("luxInit", handle_init);

        registry.register(CMD_SERVER_CONNECT, handle_server_connect);
        registry.register(CMD_SERVER_RECONNECT, handle_server_reconnect);
        registry.register(CMD_SERVER_RESET, handle_server_reset);
        registry.register(CMD_SERVER_DISCONNECT, handle_server_disconnect);
        registry.register(CMD_GET_FILM, handle_get_film);
        registry.register(CMD_GET_LOG, handle_get_log);
        registry.register(CMD_SET_NOISE_AWARE_MAP, handle_set_map);
        registry.register(CMD_SET_USER_SAMPLING_MAP, handle_set_map);

        tracing::debug!("Registered {} command handlers", registry.handler_count());
        registry
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn register(&self, name: &str, handler: CommandHandlerFn) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<CommandHandlerFn> {
        self.handlers.get(name).map(|entry| *entry.value())
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registered command names, sorted.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// --- Scene commands ---

/// Reads a scene command's fields, parameters and files.
async fn receive_args(conn: &mut Connection, command: &str) -> Result<CommandArgs, SessionError> {
    let shape =
        shape_of(command).ok_or_else(|| SessionError::UnknownCommand(command.to_string()))?;
    let mut args = read_args(&mut conn.wire, shape).await?;
    if let Some(params) = args.params_mut() {
        receive_files(conn, params).await?;
    }
    Ok(args)
}

fn handle_scene_command<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let args = receive_args(conn, command).await?;
        conn.apply(SceneCommand::new(command, args)).await;
        Ok(Flow::Continue)
    })
}

fn handle_film<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let mut args = receive_args(conn, command).await?;

        let film_type = args.name().unwrap_or_default();
        if !SUPPORTED_FILMS.contains(&film_type) {
            tracing::error!("Unsupported film type for server rendering: {}", film_type);
            return Ok(Flow::Continue);
        }

        if let Some(params) = args.params_mut() {
            for flag in FILM_OUTPUT_FLAGS {
                params.add_bool(flag, false);
            }
            for halt in FILM_HALT_PARAMS {
                params.erase(halt);
            }
            params.add_bool("disable_noisemap_update", true);
        }

        conn.apply(SceneCommand::new(command, args)).await;
        Ok(Flow::Continue)
    })
}

fn handle_world_end<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let args = receive_args(conn, command).await?;
        if conn.apply(SceneCommand::new(command, args)).await
            && conn.server.ctx.target().lock().await.is_rendering()
        {
            tracing::info!(
                "Scene ready, rendering with {} threads",
                conn.server.config.thread_count
            );
        }
        Ok(Flow::Continue)
    })
}

fn handle_init<'a>(_conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        tracing::error!(severe = true, "Server already initialized");
        Ok(Flow::Continue)
    })
}

// --- Session commands ---

fn handle_server_connect<'a>(conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let Some(sid) = conn.server.begin_session().await else {
            tracing::info!("Refusing connection from {}: server is busy", conn.peer);
            conn.wire.write_line(RESP_BUSY).await?;
            return Ok(Flow::Continue);
        };

        tracing::info!("New session ID: {}", sid);
        conn.wire.write_line(RESP_OK).await?;
        conn.wire.write_line(SERVER_VERSION_STRING).await?;
        conn.wire.write_line(&sid.to_string()).await?;

        let echoed = match conn.wire.read_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Connection handshake with {} failed: {}", conn.peer, e);
                conn.server.abandon_session(sid).await;
                return Ok(Flow::Close);
            }
        };
        if echoed.trim() != sid.to_string() {
            tracing::warn!(
                "Connection handshake with {} failed: wrong session ID '{}'",
                conn.peer,
                echoed
            );
            conn.server.abandon_session(sid).await;
            return Ok(Flow::Close);
        }

        conn.wire.write_line(RESP_CONNECTED).await?;
        tracing::info!("Master {} connected", conn.peer);
        Ok(Flow::Continue)
    })
}

fn handle_server_reconnect<'a>(conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let reply = if conn.validate_access().await {
            tracing::info!("Master {} reconnected", conn.peer);
            RESP_CONNECTED
        } else if conn.server.state().await == ServerState::Busy {
            tracing::warn!("Reconnect from {} with an unknown session ID", conn.peer);
            RESP_DENIED
        } else {
            RESP_IDLE
        };
        conn.wire.write_line(reply).await?;
        Ok(Flow::Continue)
    })
}

fn handle_server_reset<'a>(conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if conn.server.state().await != ServerState::Busy {
            conn.wire.write_line(RESP_IDLE).await?;
            return Ok(Flow::Continue);
        }

        let salt = format!("{:032x}", rand::random::<u128>());
        conn.wire.write_line(RESP_CHALLENGE).await?;
        conn.wire.write_line(&salt).await?;

        let answer = match conn.wire.read_line().await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Reset from {} abandoned: {}", conn.peer, e);
                return Ok(Flow::Close);
            }
        };
        let expected = challenge_response(&salt, &conn.server.config.password);
        if answer.trim() != expected {
            tracing::warn!("Reset from {} denied: wrong password", conn.peer);
            conn.wire.write_line(RESP_DENIED).await?;
            return Ok(Flow::Continue);
        }

        tracing::info!("Reset requested by {}, ending session", conn.peer);
        {
            let mut target = conn.server.ctx.target().lock().await;
            if target.is_rendering() {
                let path = conn.server.flm_path("server_reset");
                match target.write_resume_film(&path) {
                    Ok(written) => tracing::info!("Film saved to '{}'", written.display()),
                    Err(e) => tracing::error!("Unable to save film before reset: {:#}", e),
                }
            }
        }
        conn.server.cleanup_session().await;

        conn.wire.write_line(RESP_RESET).await?;
        Ok(Flow::Continue)
    })
}

fn handle_server_disconnect<'a>(conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if conn.validate_access().await {
            tracing::info!("Master ended session, cleaning up");
            conn.server.cleanup_session().await;
        } else {
            tracing::warn!("Ignoring disconnect from {} with an unknown session ID", conn.peer);
        }
        Ok(Flow::Continue)
    })
}

// --- Pull and push commands ---

fn handle_get_film<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if !conn.validate_access().await {
            conn.refuse(command).await;
            return Ok(Flow::Close);
        }

        tracing::info!("Transmitting film samples");
        // Held until the bytes are out so samples are reset exactly once they are delivered.
        let target = conn.server.ctx.target().clone();
        let mut target = target.lock().await;
        let bytes = match target.film_snapshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Unable to read film samples: {:#}", e);
                return Ok(Flow::Close);
            }
        };

        if conn.server.config.write_flm {
            let path = conn.server.flm_path("server_resume");
            if let Err(e) = write_atomically(&path, &bytes) {
                tracing::error!("Unable to write '{}': {}", path.display(), e);
            }
        }

        let sent = match conn.wire.write_raw(&bytes).await {
            Ok(()) => conn.wire.flush().await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                target.reset_film();
                tracing::info!("Finished film samples transmission");
            }
            Err(e) => tracing::error!(
                "Film transmission to {} failed, samples kept: {}",
                conn.peer,
                e
            ),
        }
        Ok(Flow::Close)
    })
}

fn handle_get_log<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if !conn.validate_access().await {
            conn.refuse(command).await;
            return Ok(Flow::Close);
        }

        for record in conn.server.ctx.log_buffer().drain() {
            conn.wire.write_line(&record.to_line()).await?;
        }
        tracing::debug!("Finished log transmission");
        Ok(Flow::Close)
    })
}

fn handle_set_map<'a>(conn: &'a mut Connection, command: &'a str) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        if !conn.validate_access().await {
            conn.refuse(command).await;
            return Ok(Flow::Close);
        }

        let count = conn.wire.read_u32_le().await? as usize;
        let payload = conn.wire.read_to_end().await?;
        let map = decode_floats(&decompress(&payload)?, count)?;

        let result = {
            let mut target = conn.server.ctx.target().lock().await;
            if command == CMD_SET_NOISE_AWARE_MAP {
                target.set_noise_aware_map(map)
            } else {
                target.set_user_sampling_map(map)
            }
        };
        match result {
            Ok(()) => tracing::info!("Applied {} ({} values)", command, count),
            Err(e) => tracing::error!("Unable to apply {}: {:#}", command, e),
        }
        Ok(Flow::Close)
    })
}
