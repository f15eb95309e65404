use clap::{Parser, Subcommand, ValueEnum};
use render_farm::config::{FarmConfig, ServerConfig};
use render_farm::context::{RenderContext, SharedTarget};
use render_farm::logging::{self, LogBuffer, LogCapture, Severity};
use render_farm::master::coordinator::Coordinator;
use render_farm::scene::recorder::SceneRecorder;
use render_farm::worker::server::RenderServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "render-farm", version, about = "Distributed rendering master/slave node")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a rendering slave waiting for a master
    Serve {
        /// JSON file with server settings
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        /// Password accepted by `reset`
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Keep a resumable film snapshot on every film pull
        #[arg(long)]
        write_flm: bool,
    },
    /// Force a slave out of its current session
    Reset {
        /// host[:port]
        server: String,
        #[arg(long)]
        password: String,
        /// JSON file with master settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = Severity::from(cli.log_level);

    match cli.command {
        Command::Serve {
            config,
            port,
            password,
            threads,
            work_dir,
            write_flm,
        } => {
            // 1. Settings: file first, flags on top
            let mut server_config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(port) = port {
                server_config.tcp_port = port;
            }
            if let Some(password) = password {
                server_config.password = password;
            }
            if let Some(threads) = threads {
                server_config.thread_count = threads.max(1);
            }
            if let Some(work_dir) = work_dir {
                server_config.work_dir = work_dir;
            }
            server_config.write_flm |= write_flm;

            // 2. Logging, with own diagnostics buffered for the master
            let log_buffer = LogBuffer::new(server_config.log_buffer_capacity);
            logging::init(
                level,
                Some(LogCapture::new(log_buffer.clone(), Severity::Info)),
            );

            // 3. Render context and listener
            let target: SharedTarget = Arc::new(Mutex::new(SceneRecorder::new()));
            let ctx = RenderContext::new(target)
                .with_log_filter(level)
                .with_log_buffer(log_buffer);
            let server = RenderServer::new(server_config, ctx);
            server.start().await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            server.stop().await;
        }
        Command::Reset {
            server,
            password,
            config,
        } => {
            logging::init(level, None);

            let farm_config = match config {
                Some(path) => FarmConfig::load(&path)?,
                None => FarmConfig::default(),
            };
            let target: SharedTarget = Arc::new(Mutex::new(SceneRecorder::new()));
            let coordinator = Coordinator::new(farm_config, RenderContext::new(target));

            if !coordinator.reset(&server, &password).await {
                anyhow::bail!("unable to reset server {}", server);
            }
            tracing::info!("Server {} reset", server);
        }
    }

    Ok(())
}
