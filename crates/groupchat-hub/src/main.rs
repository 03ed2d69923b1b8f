use anyhow::Context;
use clap::Parser;
use groupchat_hub::ServerConfig;
use std::{
    fs::{File, OpenOptions},
    io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

#[derive(Parser, Debug)]
#[command(name = "groupchat-hub", about = "Tab-delimited group chat relay server")]
struct Args {
    /// TCP port to listen on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    queue_capacity: u32,
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,
    /// Milliseconds given to sessions and the dispatcher to drain on shutdown.
    #[arg(long, default_value_t = 500)]
    shutdown_grace: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Also append logs to `groupchat-hub-<port>.log` in this directory.
    /// Falls back to `GROUPCHAT_LOG_DIR`.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

struct Settings {
    server: ServerConfig,
    log_level: String,
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings();
    init_logging(&settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "hub_signal", signal = "ctrl_c");
        }
        let _ = shutdown_tx.send(true);
    });

    let addr = settings.server.bind_addr;
    groupchat_hub::run(settings.server, shutdown_rx)
        .await
        .map_err(|err| {
            error!(event = "hub_error", error = %err);
            err
        })
        .with_context(|| format!("chat hub on {addr} failed"))
}

fn load_settings() -> Settings {
    let args = Args::parse();
    let mut server = ServerConfig::new(SocketAddr::new(args.bind, args.port));
    server.write_timeout = Duration::from_secs(args.write_timeout);
    server.handshake_timeout = Duration::from_secs(args.handshake_timeout);
    server.queue_capacity = args.queue_capacity as usize;
    server.shutdown_grace = Duration::from_millis(args.shutdown_grace);

    let debug = args.debug || env_true("GROUPCHAT_HUB_DEBUG");
    let log_dir = args.log_dir.or_else(|| non_empty_env("GROUPCHAT_LOG_DIR").map(PathBuf::from));
    Settings {
        log_level: log_level(debug, non_empty_env("GROUPCHAT_LOG_LEVEL")),
        log_file: log_dir.map(|dir| dir.join(format!("groupchat-hub-{}.log", args.port))),
        server,
    }
}

/// `--debug` wins over `GROUPCHAT_LOG_LEVEL`; `RUST_LOG` wins over both.
fn log_level(debug: bool, configured: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    configured.unwrap_or_else(|| "info".to_string())
}

fn init_logging(settings: &Settings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let writer = match settings.log_file.as_deref().map(open_log_file) {
        Some(Ok(file)) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        Some(Err(err)) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
        None => BoxMakeWriter::new(io::stdout),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    non_empty_env(key).is_some_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
