//! Master and slave talking over loopback TCP.

use render_farm::config::{FarmConfig, ServerConfig};
use render_farm::context::{RenderContext, RenderTarget, SharedTarget};
use render_farm::logging::{LogRecord, Severity};
use render_farm::master::coordinator::Coordinator;
use render_farm::master::types::MapKind;
use render_farm::scene::params::ParamSet;
use render_farm::scene::recorder::SceneRecorder;
use render_farm::wire::commands::CommandArgs;
use render_farm::wire::hash::content_hash;
use render_farm::worker::server::RenderServer;
use render_farm::worker::types::ServerState;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

const PASSWORD: &str = "farm-secret";

struct Slave {
    server: Arc<RenderServer>,
    recorder: Arc<Mutex<SceneRecorder>>,
    work_dir: TempDir,
}

impl Slave {
    async fn start() -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Mutex::new(SceneRecorder::new()));
        let target: SharedTarget = recorder.clone();
        let config = ServerConfig {
            password: PASSWORD.to_string(),
            tcp_port: 0,
            bind_ipv4: Some(Ipv4Addr::LOCALHOST),
            bind_ipv6: None,
            work_dir: work_dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let server = RenderServer::new(config, RenderContext::new(target));
        server.start().await.unwrap();
        Self {
            server,
            recorder,
            work_dir,
        }
    }

    fn name(&self) -> String {
        format!("127.0.0.1:{}", self.server.port())
    }
}

fn master() -> (Arc<Coordinator>, Arc<Mutex<SceneRecorder>>) {
    master_polling_every(3600)
}

fn master_polling_every(secs: u64) -> (Arc<Coordinator>, Arc<Mutex<SceneRecorder>>) {
    let recorder = Arc::new(Mutex::new(SceneRecorder::new()));
    let target: SharedTarget = recorder.clone();
    let config = FarmConfig {
        polling_interval_secs: secs,
        connect_timeout_secs: 2,
        ..FarmConfig::default()
    };
    (Coordinator::new(config, RenderContext::new(target)), recorder)
}

fn named(name: &str, params: ParamSet) -> CommandArgs {
    CommandArgs::named(name, params)
}

#[tokio::test]
async fn test_full_session_over_tcp() {
    // ARRANGE
    let slave = Slave::start().await;
    let (farm, master_film) = master();
    let scene_dir = tempfile::tempdir().unwrap();
    let mesh = scene_dir.path().join("teapot.ply");
    std::fs::write(&mesh, b"ply\nelement vertex 0\n").unwrap();

    // ACT: Connect
    assert!(farm.connect(&slave.name()).await);
    assert!(!farm.connect(&slave.name()).await);

    // ASSERT
    assert_eq!(slave.server.state().await, ServerState::Busy);
    assert_eq!(farm.slave_node_count(), 1);
    assert!(farm.update_time_remaining() > 0);

    // ACT: Describe a scene; luxWorldEnd flushes it
    let mut film = ParamSet::new();
    film.add_int("xresolution", 4);
    film.add_int("yresolution", 2);
    let mut shape = ParamSet::new();
    shape.add_string("filename", &mesh.to_string_lossy());

    farm.send("luxFilm", named("fleximage", film)).await.unwrap();
    farm.send("luxCamera", named("perspective", ParamSet::new()))
        .await
        .unwrap();
    farm.send("luxWorldBegin", CommandArgs::Empty).await.unwrap();
    farm.send("luxShape", named("plymesh", shape)).await.unwrap();
    farm.send("luxWorldEnd", CommandArgs::Empty).await.unwrap();

    // ASSERT: Slave rebuilt the scene with a local copy of the mesh
    let local = slave.work_dir.path().join(format!(
        "tmp_{}.ply",
        content_hash(b"ply\nelement vertex 0\n")
    ));
    {
        let recorder = slave.recorder.lock().await;
        assert_eq!(
            recorder.command_names(),
            vec!["luxFilm", "luxCamera", "luxWorldBegin", "luxShape", "luxWorldEnd"]
        );
        assert!(recorder.is_rendering());
        assert_eq!(recorder.film().resolution(), (4, 2));
    }
    assert!(local.exists());
    assert_eq!(farm.file_stats().await, (1, 1));

    // ACT: Slave renders, master pulls
    slave
        .recorder
        .lock()
        .await
        .film_mut()
        .add_sample(1, 1, [1.0, 1.0, 1.0]);
    let merged = farm.update_film().await;

    // ASSERT
    assert_eq!(merged, 1.0);
    assert_eq!(master_film.lock().await.film().sample_count(), 1.0);
    assert_eq!(farm.update_film().await, 0.0);
    let status = farm.status().await;
    assert_eq!(status.len(), 1);
    assert!(status[0].active);
    assert_eq!(status[0].samples_received, 1.0);

    // ACT: Log pull and map push
    slave.server.context().log_buffer().push(LogRecord {
        severity: Severity::Error,
        code: 2,
        message: "out of memory".into(),
    });
    farm.update_log().await;
    let map = vec![0.5f32; 8];
    farm.push_map(MapKind::NoiseAware, map.len(), map.clone())
        .await
        .unwrap();

    // ASSERT
    assert!(slave.server.context().log_buffer().is_empty());
    assert_eq!(
        slave.recorder.lock().await.film().noise_aware_map(),
        Some(&map[..])
    );

    // ACT: Disconnect
    farm.disconnect(&slave.name()).await;

    // ASSERT: Slave is idle again and its files are gone
    assert_eq!(slave.server.state().await, ServerState::Ready);
    assert!(!local.exists());
    assert_eq!(farm.slave_node_count(), 0);
    assert_eq!(farm.update_time_remaining(), 0);
}

#[tokio::test]
async fn test_late_slave_receives_complete_scene_on_connect() {
    let slave = Slave::start().await;
    let (farm, _) = master();

    farm.send("luxCamera", named("perspective", ParamSet::new()))
        .await
        .unwrap();
    farm.send("luxWorldBegin", CommandArgs::Empty).await.unwrap();
    farm.send("luxWorldEnd", CommandArgs::Empty).await.unwrap();
    assert!(farm.connect(&slave.name()).await);

    let recorder = slave.recorder.lock().await;
    assert_eq!(
        recorder.command_names(),
        vec!["luxCamera", "luxWorldBegin", "luxWorldEnd"]
    );
    assert!(recorder.is_rendering());
}

#[tokio::test]
async fn test_reset_requires_password() {
    // ARRANGE: One master holds the slave
    let slave = Slave::start().await;
    let (owner, _) = master();
    let (other, _) = master();
    assert!(other.reset(&slave.name(), PASSWORD).await);
    assert!(owner.connect(&slave.name()).await);

    // ACT + ASSERT
    assert!(!other.reset(&slave.name(), "wrong").await);
    assert_eq!(slave.server.state().await, ServerState::Busy);

    assert!(other.reset(&slave.name(), PASSWORD).await);
    assert_eq!(slave.server.state().await, ServerState::Ready);

    // The original owner's film pull is refused; it then opens a new session
    assert_eq!(owner.update_film().await, 0.0);
    assert!(owner.status().await[0].active);
    assert_eq!(slave.server.state().await, ServerState::Busy);
}

#[tokio::test]
async fn test_unreachable_slave_is_excluded() {
    // ARRANGE: A port nothing listens on
    let placeholder = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let dead_port = placeholder.local_addr().unwrap().port();
    drop(placeholder);
    let (farm, _) = master();

    // ACT + ASSERT: Never joins the roster
    assert!(!farm.connect(&format!("127.0.0.1:{dead_port}")).await);
    assert!(farm.status().await.is_empty());

    // ACT: A connected slave goes away
    let slave = Slave::start().await;
    assert!(farm.connect(&slave.name()).await);
    slave.server.stop().await;
    let merged = farm.update_film().await;

    // ASSERT: Kept in the roster, but inactive
    assert_eq!(merged, 0.0);
    let status = farm.status().await;
    assert_eq!(status.len(), 1);
    assert!(!status[0].active);
}

/// Sends a minimal 4x2 scene that completes the command log.
async fn describe_scene(farm: &Coordinator) {
    let mut film = ParamSet::new();
    film.add_int("xresolution", 4);
    film.add_int("yresolution", 2);
    farm.send("luxFilm", named("fleximage", film)).await.unwrap();
    farm.send("luxCamera", named("perspective", ParamSet::new()))
        .await
        .unwrap();
    farm.send("luxWorldBegin", CommandArgs::Empty).await.unwrap();
    farm.send("luxWorldEnd", CommandArgs::Empty).await.unwrap();
}

#[tokio::test]
async fn test_periodic_task_pulls_film_without_being_asked() {
    // ARRANGE: One second polling
    let slave = Slave::start().await;
    let (farm, master_film) = master_polling_every(1);
    describe_scene(&farm).await;
    assert!(farm.connect(&slave.name()).await);
    slave
        .recorder
        .lock()
        .await
        .film_mut()
        .add_sample(2, 1, [0.5, 0.5, 0.5]);

    // ACT
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // ASSERT
    assert_eq!(master_film.lock().await.film().sample_count(), 1.0);
    assert_eq!(slave.recorder.lock().await.film().sample_count(), 0.0);
    assert_eq!(farm.status().await[0].samples_received, 1.0);
}

#[tokio::test]
async fn test_failed_slave_is_restored_without_replay() {
    // ARRANGE: A flushed slave whose film the master cannot merge
    let slave = Slave::start().await;
    let (farm, master_film) = master();
    describe_scene(&farm).await;
    assert!(farm.connect(&slave.name()).await);
    let sid = slave.server.current_session().await;
    master_film.lock().await.film_mut().resize(8, 8).unwrap();
    slave
        .recorder
        .lock()
        .await
        .film_mut()
        .add_sample(0, 0, [1.0, 1.0, 1.0]);

    // ACT: The pull fails, the same call reconnects the session
    let merged = farm.update_film().await;
    farm.reconnect_failed().await;

    // ASSERT: Active again on the same session, scene applied once
    assert_eq!(merged, 0.0);
    let status = farm.status().await;
    assert_eq!(status.len(), 1);
    assert!(status[0].active);
    assert_eq!(status[0].samples_received, 0.0);
    assert_eq!(slave.server.current_session().await, sid);
    assert_eq!(slave.server.state().await, ServerState::Busy);
    assert_eq!(
        slave.recorder.lock().await.command_names(),
        vec!["luxFilm", "luxCamera", "luxWorldBegin", "luxWorldEnd"]
    );
}
