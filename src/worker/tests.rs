//! Render Server Tests
//!
//! Drives a started `RenderServer` over in-memory duplex connections, speaking the
//! protocol by hand.
//!
//! ## Test Scopes
//! - **Registry**: Default command table and custom registration.
//! - **Session**: Connect handshake, busy refusal, reconnect and reset authentication,
//!   peers that hang up mid-exchange.
//! - **Teardown**: Unknown commands and invalid file indices end the session.
//! - **Scene**: Parameterized commands with file transfer, integrity resend, film overrides.
//! - **Pull/Push**: Film and log pulls, map pushes.

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::context::{RenderContext, SharedTarget};
    use crate::logging::{LogRecord, Severity};
    use crate::scene::params::ParamSet;
    use crate::scene::recorder::SceneRecorder;
    use crate::wire::codec::{Wire, compress, encode_floats};
    use crate::wire::commands::{CommandArgs, SCENE_COMMANDS, encode_params};
    use crate::wire::hash::{challenge_response, content_hash};
    use crate::wire::protocol::*;
    use crate::worker::handlers::{BoxFuture, CommandRegistry, Connection, HandlerResult};
    use crate::worker::server::RenderServer;
    use crate::worker::types::{Flow, ServerState, SessionId};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, duplex};
    use tokio::sync::Mutex;

    const PASSWORD: &str = "s3cret";

    async fn started_server() -> (Arc<RenderServer>, Arc<Mutex<SceneRecorder>>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Mutex::new(SceneRecorder::new()));
        let target: SharedTarget = recorder.clone();
        let config = ServerConfig {
            password: PASSWORD.to_string(),
            tcp_port: 0,
            bind_ipv4: Some(Ipv4Addr::LOCALHOST),
            bind_ipv6: None,
            work_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let server = RenderServer::new(config, RenderContext::new(target));
        server.start().await.unwrap();
        (server, recorder, dir)
    }

    fn open(server: &Arc<RenderServer>) -> Wire<DuplexStream> {
        let (client, stream) = duplex(1 << 20);
        tokio::spawn(server.clone().serve_connection(stream, "test-master".to_string()));
        Wire::new(client)
    }

    async fn connect(server: &Arc<RenderServer>) -> String {
        let mut wire = open(server);
        wire.write_line(CMD_SERVER_CONNECT).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_OK);
        assert_eq!(wire.read_line().await.unwrap(), SERVER_VERSION_STRING);
        let sid = wire.read_line().await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.expect_line(RESP_CONNECTED).await.unwrap();
        sid
    }

    /// Waits for the server to close a connection that ended with `Flow::Close`.
    async fn wait_closed(wire: &mut Wire<DuplexStream>) -> Vec<u8> {
        wire.read_to_end().await.unwrap()
    }

    // ============================================================
    // TEST 1: CommandRegistry
    // ============================================================

    #[test]
    fn test_default_registry_covers_every_command() {
        let registry = CommandRegistry::with_default_handlers();

        for (name, _) in SCENE_COMMANDS {
            assert!(registry.has_handler(name), "missing handler for {name}");
        }
        assert!(registry.has_handler(CMD_SERVER_CONNECT));
        assert!(registry.has_handler(CMD_SET_USER_SAMPLING_MAP));
        assert!(registry.has_handler("luxInit"));
        assert_eq!(registry.handler_count(), SCENE_COMMANDS.len() + 9);
        assert!(registry.get("luxBogus").is_none());
    }

    fn handle_ping<'a>(conn: &'a mut Connection, _command: &'a str) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            conn.wire.write_line("PONG").await?;
            Ok(Flow::Continue)
        })
    }

    #[tokio::test]
    async fn test_custom_handler_is_dispatched() {
        // ARRANGE: Registry with one extra command
        let registry = CommandRegistry::with_default_handlers();
        registry.register("Ping", handle_ping);
        let recorder: SharedTarget = Arc::new(Mutex::new(SceneRecorder::new()));
        let server =
            RenderServer::with_registry(ServerConfig::default(), RenderContext::new(recorder), registry);

        // ACT
        let mut wire = open(&server);
        wire.write_line("").await.unwrap();
        wire.write_line("Ping").await.unwrap();

        // ASSERT: Blank line ignored, handler answered
        assert_eq!(wire.read_line().await.unwrap(), "PONG");
        assert!(server.handlers().list_handlers().contains(&"Ping".to_string()));
    }

    // ============================================================
    // TEST 2: Session handshake
    // ============================================================

    #[tokio::test]
    async fn test_connect_makes_server_busy_and_refuses_second_master() {
        // ARRANGE
        let (server, _recorder, _dir) = started_server().await;
        assert_eq!(server.state().await, ServerState::Ready);

        // ACT
        let sid = connect(&server).await;

        // ASSERT
        assert_eq!(server.state().await, ServerState::Busy);
        assert_eq!(server.current_session().await, SessionId::parse(&sid));

        let mut other = open(&server);
        other.write_line(CMD_SERVER_CONNECT).await.unwrap();
        assert_eq!(other.read_line().await.unwrap(), RESP_BUSY);
        assert_eq!(server.current_session().await, SessionId::parse(&sid));
    }

    #[tokio::test]
    async fn test_failed_handshake_returns_to_ready() {
        let (server, _recorder, _dir) = started_server().await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_CONNECT).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_OK);
        let _version = wire.read_line().await.unwrap();
        let _sid = wire.read_line().await.unwrap();
        wire.write_line(&SessionId::new().to_string()).await.unwrap();
        wait_closed(&mut wire).await;

        assert_eq!(server.state().await, ServerState::Ready);
        assert!(server.current_session().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_connected_denied_idle() {
        // ARRANGE: No session yet
        let (server, _recorder, _dir) = started_server().await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&SessionId::new().to_string()).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_IDLE);

        // ACT: Open a session
        let sid = connect(&server).await;

        // ASSERT
        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_CONNECTED);

        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&SessionId::new().to_string()).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_DENIED);

        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line("not-a-session").await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_DENIED);
    }

    // ============================================================
    // TEST 3: Reset challenge
    // ============================================================

    #[tokio::test]
    async fn test_reset_on_ready_server_is_idle_without_challenge() {
        let (server, _recorder, _dir) = started_server().await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_RESET).await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), RESP_IDLE);
        assert_eq!(server.state().await, ServerState::Ready);
    }

    #[tokio::test]
    async fn test_reset_wrong_answer_is_denied_and_keeps_session() {
        let (server, _recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_RESET).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_CHALLENGE);
        let salt = wire.read_line().await.unwrap();
        wire.write_line(&challenge_response(&salt, "guess")).await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), RESP_DENIED);
        assert_eq!(server.state().await, ServerState::Busy);
        assert_eq!(server.current_session().await, SessionId::parse(&sid));
    }

    #[tokio::test]
    async fn test_reset_correct_answer_ends_session() {
        let (server, _recorder, _dir) = started_server().await;
        connect(&server).await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_RESET).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_CHALLENGE);
        let salt = wire.read_line().await.unwrap();
        wire.write_line(&challenge_response(&salt, PASSWORD)).await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), RESP_RESET);
        assert_eq!(server.state().await, ServerState::Ready);
        assert!(server.current_session().await.is_none());
    }

    #[tokio::test]
    async fn test_reset_abandoned_after_challenge_keeps_session() {
        // ARRANGE
        let (server, _recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let mut wire = open(&server);

        // ACT: Read the challenge, then hang up without answering
        wire.write_line(CMD_SERVER_RESET).await.unwrap();
        assert_eq!(wire.read_line().await.unwrap(), RESP_CHALLENGE);
        let _salt = wire.read_line().await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;

        // ASSERT
        assert_eq!(server.state().await, ServerState::Busy);
        assert_eq!(server.current_session().await, SessionId::parse(&sid));
    }

    #[tokio::test]
    async fn test_missing_session_id_line_is_refused() {
        let (server, _recorder, _dir) = started_server().await;
        let sid = connect(&server).await;

        for command in [CMD_GET_FILM, CMD_GET_LOG, CMD_SET_NOISE_AWARE_MAP, CMD_SERVER_DISCONNECT] {
            let mut wire = open(&server);
            wire.write_line(command).await.unwrap();
            wire.shutdown().await.unwrap();

            assert!(wait_closed(&mut wire).await.is_empty(), "{command} answered");
            assert_eq!(server.state().await, ServerState::Busy, "{command} ended the session");
        }
        assert_eq!(server.current_session().await, SessionId::parse(&sid));
    }

    // ============================================================
    // TEST 4: Session teardown
    // ============================================================

    #[tokio::test]
    async fn test_unknown_command_ends_session() {
        let (server, _recorder, _dir) = started_server().await;
        connect(&server).await;
        let mut wire = open(&server);

        wire.write_line("luxBogus").await.unwrap();
        wait_closed(&mut wire).await;

        assert_eq!(server.state().await, ServerState::Ready);
        assert!(server.current_session().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_with_foreign_session_is_ignored() {
        let (server, _recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let mut wire = open(&server);

        wire.write_line(CMD_SERVER_DISCONNECT).await.unwrap();
        wire.write_line(&SessionId::new().to_string()).await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;
        assert_eq!(server.state().await, ServerState::Busy);

        let mut wire = open(&server);
        wire.write_line(CMD_SERVER_DISCONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;
        assert_eq!(server.state().await, ServerState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_file_index_is_refused() {
        let (server, _recorder, _dir) = started_server().await;
        connect(&server).await;
        let mut wire = open(&server);

        wire.write_line("luxShape").await.unwrap();
        wire.write_line("trianglemesh").await.unwrap();
        wire.write_blob(&encode_params(&ParamSet::new()).unwrap()).await.unwrap();
        wire.write_line(BEGIN_FILE_INDEX).await.unwrap();
        wire.expect_line(BEGIN_FILE_INDEX_OK).await.unwrap();
        wire.write_line("filename").await.unwrap();
        wire.write_line("mesh.ply").await.unwrap();
        wire.write_line("../../escape").await.unwrap();
        wire.write_line("").await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), FILE_INDEX_INVALID);
        wait_closed(&mut wire).await;
        assert_eq!(server.state().await, ServerState::Ready);
    }

    // ============================================================
    // TEST 5: Scene commands and file transfer
    // ============================================================

    #[tokio::test]
    async fn test_file_is_stored_by_hash_after_one_resend() {
        // ARRANGE
        let (server, recorder, dir) = started_server().await;
        let sid = connect(&server).await;
        let good = b"ply\nformat ascii 1.0\n".to_vec();
        let bad = b"ply\nformat ascii 2.0\n".to_vec();
        let hash = content_hash(&good);
        let mut params = ParamSet::new();
        params.add_string("filename", "/scenes/mesh.ply");

        // ACT: Index one file, send corrupt bytes first
        let mut wire = open(&server);
        wire.write_line("luxShape").await.unwrap();
        wire.write_line("plymesh").await.unwrap();
        wire.write_blob(&encode_params(&params).unwrap()).await.unwrap();
        wire.write_line(BEGIN_FILE_INDEX).await.unwrap();
        wire.expect_line(BEGIN_FILE_INDEX_OK).await.unwrap();
        for line in ["filename", "/scenes/mesh.ply", hash.as_str(), ""] {
            wire.write_line(line).await.unwrap();
        }
        wire.write_line(END_FILE_INDEX).await.unwrap();
        wire.expect_line(END_FILE_INDEX_OK).await.unwrap();
        wire.write_line(BEGIN_FILES).await.unwrap();
        wire.expect_line(BEGIN_FILES_OK).await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), hash);
        for (body, reply) in [(&bad, RESEND_FILE), (&good, FILE_OK)] {
            wire.write_line("/scenes/mesh.ply").await.unwrap();
            wire.write_line(&body.len().to_string()).await.unwrap();
            wire.write_raw(body).await.unwrap();
            wire.expect_line(reply).await.unwrap();
        }
        wire.expect_line(END_FILES).await.unwrap();
        wire.write_line(END_FILES_OK).await.unwrap();

        // Round-trip a reconnect so the command is known to be applied
        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.expect_line(RESP_CONNECTED).await.unwrap();

        // ASSERT: Stored under its hash with the extension kept
        let local = dir.path().join(format!("tmp_{hash}.ply"));
        assert_eq!(std::fs::read(&local).unwrap(), good);
        {
            let recorder = recorder.lock().await;
            let shape = &recorder.commands()[0];
            assert_eq!(shape.name, "luxShape");
            let params = shape.args.params().unwrap();
            assert_eq!(params.find_one_string("filename"), Some(local.to_string_lossy().as_ref()));
        }

        // ACT: End the session
        wire.write_line(CMD_SERVER_DISCONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;

        // ASSERT: Session files are gone
        assert!(!local.exists());
        assert_eq!(server.state().await, ServerState::Ready);
    }

    #[tokio::test]
    async fn test_files_received_without_session_are_removed_on_connect() {
        // ARRANGE: A Ready server receives a mesh outside any session
        let (server, _recorder, dir) = started_server().await;
        let body = b"ply\nelement face 0\n".to_vec();
        let hash = content_hash(&body);
        let mut params = ParamSet::new();
        params.add_string("filename", "/scenes/stray.ply");

        let mut wire = open(&server);
        wire.write_line("luxShape").await.unwrap();
        wire.write_line("plymesh").await.unwrap();
        wire.write_blob(&encode_params(&params).unwrap()).await.unwrap();
        wire.write_line(BEGIN_FILE_INDEX).await.unwrap();
        wire.expect_line(BEGIN_FILE_INDEX_OK).await.unwrap();
        for line in ["filename", "/scenes/stray.ply", hash.as_str(), "", END_FILE_INDEX] {
            wire.write_line(line).await.unwrap();
        }
        wire.expect_line(END_FILE_INDEX_OK).await.unwrap();
        wire.write_line(BEGIN_FILES).await.unwrap();
        wire.expect_line(BEGIN_FILES_OK).await.unwrap();
        wire.expect_line(&hash).await.unwrap();
        wire.write_line("/scenes/stray.ply").await.unwrap();
        wire.write_line(&body.len().to_string()).await.unwrap();
        wire.write_raw(&body).await.unwrap();
        wire.expect_line(FILE_OK).await.unwrap();
        wire.expect_line(END_FILES).await.unwrap();
        wire.write_line(END_FILES_OK).await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;

        let stray = dir.path().join(format!("tmp_{hash}.ply"));
        assert!(stray.exists());

        // ACT
        connect(&server).await;

        // ASSERT
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn test_film_command_is_forced_to_server_settings() {
        // ARRANGE
        let (server, recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let mut params = ParamSet::new();
        params.add_bool("write_png", true);
        params.add_int("haltspp", 64);
        params.add_int("xresolution", 16);
        params.add_int("yresolution", 8);

        // ACT: One supported and one unsupported film
        let mut wire = open(&server);
        for film_type in ["fleximage", "blender"] {
            wire.write_line("luxFilm").await.unwrap();
            wire.write_raw(CommandArgs::named(film_type, ParamSet::new()).plain_fields().as_bytes())
                .await
                .unwrap();
            wire.write_blob(&encode_params(&params).unwrap()).await.unwrap();
            wire.write_line(FILE_INDEX_EMPTY).await.unwrap();
        }
        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.expect_line(RESP_CONNECTED).await.unwrap();

        // ASSERT
        let recorder = recorder.lock().await;
        assert_eq!(recorder.commands().len(), 1);
        let applied = recorder.commands()[0].args.params().unwrap();
        assert_eq!(applied.find_one_bool("write_png"), Some(false));
        assert_eq!(applied.find_one_bool("write_resume_flm"), Some(false));
        assert_eq!(applied.find_one_bool("disable_noisemap_update"), Some(true));
        assert!(!applied.contains("haltspp"));
        assert_eq!(recorder.film().resolution(), (16, 8));
    }

    #[tokio::test]
    async fn test_scene_error_keeps_connection_open() {
        let (server, recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let mut wire = open(&server);

        // No camera: applying luxWorldEnd fails inside the render target
        wire.write_line("luxWorldBegin").await.unwrap();
        wire.write_line("luxWorldEnd").await.unwrap();
        wire.write_line(CMD_SERVER_RECONNECT).await.unwrap();
        wire.write_line(&sid).await.unwrap();

        assert_eq!(wire.read_line().await.unwrap(), RESP_CONNECTED);
        assert_eq!(server.state().await, ServerState::Busy);
        assert_eq!(recorder.lock().await.command_names(), vec!["luxWorldBegin"]);
    }

    // ============================================================
    // TEST 6: Film, log and map exchanges
    // ============================================================

    #[tokio::test]
    async fn test_get_film_requires_session_and_resets_samples() {
        // ARRANGE
        let (server, recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        {
            let mut recorder = recorder.lock().await;
            recorder.film_mut().resize(2, 2).unwrap();
            recorder.film_mut().add_sample(0, 0, [1.0, 1.0, 1.0]);
        }

        // ACT: Foreign session gets nothing
        let mut wire = open(&server);
        wire.write_line(CMD_GET_FILM).await.unwrap();
        wire.write_line(&SessionId::new().to_string()).await.unwrap();
        assert!(wait_closed(&mut wire).await.is_empty());

        // ACT: Real session gets the samples
        let mut wire = open(&server);
        wire.write_line(CMD_GET_FILM).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        let bytes = wait_closed(&mut wire).await;

        // ASSERT
        let mut merged = crate::scene::film::SampleFilm::default();
        assert_eq!(merged.merge_compressed(&bytes).unwrap(), 1.0);
        assert_eq!(recorder.lock().await.film().sample_count(), 0.0);
    }

    #[tokio::test]
    async fn test_undelivered_film_keeps_samples() {
        // ARRANGE
        let (server, recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        {
            let mut recorder = recorder.lock().await;
            recorder.film_mut().resize(2, 2).unwrap();
            recorder.film_mut().add_sample(1, 0, [1.0, 1.0, 1.0]);
        }

        // ACT: Ask for the film and go away before it arrives
        let mut wire = open(&server);
        wire.write_line(CMD_GET_FILM).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.flush().await.unwrap();
        drop(wire);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // ASSERT
        assert_eq!(recorder.lock().await.film().sample_count(), 1.0);
        assert_eq!(server.state().await, ServerState::Busy);
    }

    #[tokio::test]
    async fn test_get_log_streams_and_clears_buffer() {
        let (server, _recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let buffer = server.context().log_buffer().clone();
        buffer.drain();
        buffer.push(LogRecord {
            severity: Severity::Warning,
            code: 7,
            message: "low memory".into(),
        });

        let mut wire = open(&server);
        wire.write_line(CMD_GET_LOG).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        let text = String::from_utf8(wait_closed(&mut wire).await).unwrap();

        let records: Vec<LogRecord> = text.lines().filter_map(LogRecord::parse_line).collect();
        assert!(records.contains(&LogRecord {
            severity: Severity::Warning,
            code: 7,
            message: "low memory".into(),
        }));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_noise_aware_map_is_applied() {
        let (server, recorder, _dir) = started_server().await;
        let sid = connect(&server).await;
        let map = vec![0.5f32, 1.0, 0.0, 0.25];

        let mut wire = open(&server);
        wire.write_line(CMD_SET_NOISE_AWARE_MAP).await.unwrap();
        wire.write_line(&sid).await.unwrap();
        wire.write_u32_le(map.len() as u32).await.unwrap();
        wire.write_raw(&compress(&encode_floats(&map), 4).unwrap()).await.unwrap();
        wire.shutdown().await.unwrap();
        wait_closed(&mut wire).await;

        assert_eq!(recorder.lock().await.film().noise_aware_map(), Some(&map[..]));
    }

    #[tokio::test]
    async fn test_stop_moves_to_stopped() {
        let (server, _recorder, _dir) = started_server().await;
        connect(&server).await;

        server.stop().await;

        assert_eq!(server.state().await, ServerState::Stopped);
        assert!(server.start().await.is_err());
    }
}
