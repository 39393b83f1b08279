//! relay: host-side receiver for COBS-framed RTT telemetry.
//!
//! Wires the ingest pipeline together: source supervisor → framer →
//! transformer → hub → {JSONL sink, WebSocket bridge}. A single watch
//! channel carries the root shutdown signal to every task.

pub mod bridge;
pub mod config;
pub mod hub;
pub mod jsonl;
pub mod pipeline;
pub mod source;

pub use config::{ConfigError, RelayConfig, load_config_from_path, load_config_from_str};

use crate::bridge::{PacketTransform, Transform};
use crate::hub::Hub;
use packet_core::PacketRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Fatal runtime errors; everything recoverable is handled inside the tasks.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("schema registration failed: {0}")]
    Schema(#[from] packet_core::SchemaError),
    #[error("opening jsonl sink '{path}': {source}")]
    JsonlOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Bridge(#[from] bridge::BridgeError),
    #[error("hub actor unavailable at startup")]
    HubUnavailable,
    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// Run the relay until `shutdown` fires or a fatal error occurs.
///
/// The registry is populated before any task starts and is immutable from
/// then on. Sinks are optional: the JSONL sink runs only with a configured
/// path, the bridge only with a configured listen address.
pub async fn run(cfg: RelayConfig, shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
    let registry = Arc::new(PacketRegistry::new(cfg.packets.text_id));
    for (id, schema) in &cfg.packets.schemas {
        registry.register(*id, schema.clone())?;
    }
    info!(
        schemas = cfg.packets.schemas.len(),
        text_id = cfg.packets.text_id,
        "packet registry ready"
    );

    let hub = Hub::spawn(
        cfg.hub.broadcast_buffer,
        cfg.hub.client_buffer_default,
        shutdown.clone(),
    );

    let mut tasks = Vec::new();

    if let Some(jsonl_cfg) = &cfg.jsonl {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&jsonl_cfg.path)
            .await
            .map_err(|source| RelayError::JsonlOpen {
                path: jsonl_cfg.path.clone(),
                source,
            })?;
        let sub = hub.subscribe().await.ok_or(RelayError::HubUnavailable)?;
        info!(path = %jsonl_cfg.path.display(), "jsonl sink enabled");
        tasks.push(tokio::spawn(jsonl::run_jsonl_sink(
            file,
            sub,
            shutdown.clone(),
        )));
    }

    let bridge_task = match &cfg.bridge {
        Some(bridge_cfg) => {
            let sub = hub.subscribe().await.ok_or(RelayError::HubUnavailable)?;
            let transforms: Vec<Box<dyn Transform>> =
                vec![Box::new(PacketTransform::new(&registry))];
            Some(tokio::spawn(bridge::run_bridge(
                bridge_cfg.clone(),
                transforms,
                sub,
                shutdown.clone(),
            )))
        }
        None => None,
    };

    let (frame_tx, frame_rx) = mpsc::channel(cfg.source.frame_queue_size);
    tasks.push(tokio::spawn(pipeline::run_transformer(
        Arc::clone(&registry),
        frame_rx,
        hub.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(source::run_supervisor(
        cfg.source.clone(),
        frame_tx,
        shutdown.clone(),
    )));

    // Fatal bridge failures end the run; otherwise wait for shutdown and let
    // every task drain.
    match bridge_task {
        Some(handle) => match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(RelayError::TaskFailed(e.to_string())),
        },
        None => wait_shutdown(shutdown.clone()).await,
    }
    for task in tasks {
        let _ = task.await;
    }
    info!("relay stopped");
    Ok(())
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
