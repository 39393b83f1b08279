// relay: host-side receiver for COBS-framed RTT telemetry streams.
//
// Exit codes: 0 clean shutdown, 1 fatal runtime error, 2 configuration error.

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay", version, about = "RTT telemetry relay")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "/etc/rtt-relay/relay.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let args = Args::parse();
    let cfg = match relay::load_config_from_path(&args.config) {
        Ok(cfg) => {
            info!(
                source = %cfg.source.addr,
                bridge = cfg.bridge.is_some(),
                jsonl = cfg.jsonl.is_some(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(2);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = relay::run(cfg, shutdown_rx).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}
