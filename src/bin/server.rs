//! KeyHive Server Binary
//!
//! Starts the configuration-tree server.

use std::time::Duration;

use clap::Parser;
use keyhive::network::Server;
use keyhive::{Arch, Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// KeyHive Server
#[derive(Parser, Debug)]
#[command(name = "keyhive-server")]
#[command(about = "Hierarchical configuration-tree server")]
#[command(version)]
struct Args {
    /// Configuration directory holding the branch files
    #[arg(short, long, default_value = "./keyhive_data")]
    config_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6479")]
    listen: String,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Seconds between periodic saves of dirty branches
    #[arg(short, long, default_value = "30")]
    save_interval: u64,

    /// Force the prefix architecture (win32 or win64)
    #[arg(long)]
    arch: Option<String>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keyhive=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("KeyHive Server v{}", keyhive::VERSION);
    tracing::info!("Config directory: {}", args.config_dir);
    tracing::info!("Listen address: {}", args.listen);

    let mut builder = Config::builder()
        .config_dir(&args.config_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .save_interval(Duration::from_secs(args.save_interval));
    match args.arch.as_deref() {
        Some("win32") => builder = builder.arch(Arch::Win32),
        Some("win64") => builder = builder.arch(Arch::Win64),
        Some(other) => {
            tracing::error!("unknown architecture {other:?} (expected win32 or win64)");
            std::process::exit(1);
        }
        None => {}
    }
    let config = builder.build();

    let engine = match Engine::open(config.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!("failed to open engine: {err}");
            std::process::exit(1);
        }
    };

    let mut server = Server::new(config);
    if let Err(err) = server.run(engine) {
        tracing::error!("server error: {err}");
        std::process::exit(1);
    }
}
