use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use signaling::{ServerConfig, SignalingServer};

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(about = "WebRTC Signaling Relay Daemon")]
struct Args {
    /// Listen address
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listen port
    #[arg(short, long, env = "RELAY_PORT", default_value_t = 3000)]
    port: u16,

    /// Directory of client static files served at `/`
    #[arg(long, env = "RELAY_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Per-connection outbound queue length
    #[arg(long, default_value_t = 100)]
    outbound_buffer: usize,

    /// Maximum size of a single WebSocket message in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    max_message_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::new(self.host, self.port),
            static_dir: self.static_dir.clone(),
            outbound_buffer: self.outbound_buffer,
            max_message_size: self.max_message_size,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        // シグナルを待てない場合は停止しない
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ログ設定
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Signaling Relay Daemon");
    info!("Log Level: {}", args.log_level);

    let server = SignalingServer::bind(args.server_config())
        .await
        .context("Failed to start SignalingServer")?;
    info!("Listening on {}", server.local_addr()?);

    server.run(shutdown_signal()).await?;

    info!("Relay daemon stopped");
    Ok(())
}
