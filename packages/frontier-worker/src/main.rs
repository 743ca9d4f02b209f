// Entry point for the frontier worker

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frontier_worker::codec::{Codec, JsonCodec};
use frontier_worker::control::{self, ControlState};
use frontier_worker::memory::{MemoryBackend, MemoryBus};
use frontier_worker::{BusClients, BusLocation, Cli, FrontierMessage, FrontierWorker, Request, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.log_level.as_deref() {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level '{level}'"))?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,frontier_worker=debug".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting frontier worker");

    // Load configuration from environment, flags win
    let mut config = WorkerConfig::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    tracing::info!(
        bus = %config.bus,
        group = %config.group,
        incoming = %config.incoming_topic,
        scoring = %config.scoring_topic,
        outgoing = %config.outgoing_topic,
        max_next_requests = config.max_next_requests,
        "configuration loaded"
    );

    let (clients, bus) = match config.bus {
        BusLocation::Memory => {
            let bus = MemoryBus::new();
            (BusClients::memory(&bus, &config), bus)
        }
    };

    if !config.seeds.is_empty() {
        let seeds = config.seeds.iter().map(Request::new).collect();
        let payload = JsonCodec::new()
            .encode(&FrontierMessage::AddSeeds { seeds })
            .context("Failed to encode seeds")?;
        bus.append(&config.incoming_topic, 0, Bytes::new(), payload)
            .context("Failed to publish seeds")?;
        tracing::info!(count = config.seeds.len(), "seeds published");
    }

    let backend = Arc::new(MemoryBackend::new(config.outgoing_partitions));
    let (worker, stats) = FrontierWorker::new(&config, clients, backend);
    let (scheduler, handle) = worker.into_scheduler(&config);

    let shutdown = CancellationToken::new();

    // Start control server
    let control_task = config.control_port.map(|port| {
        let state = ControlState {
            scheduler: handle.clone(),
            stats,
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = control::serve(state, port, shutdown).await {
                tracing::error!(error = ?e, "control server stopped");
            }
        })
    });

    // Ctrl-C drains
    let drain_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining");
            if let Err(e) = drain_handle.drain().await {
                tracing::debug!(error = %e, "scheduler already stopped");
            }
        }
    });

    let result = scheduler.run().await;

    shutdown.cancel();
    if let Some(task) = control_task {
        let _ = task.await;
    }

    match &result {
        Ok(()) => tracing::info!("frontier worker stopped"),
        Err(e) => tracing::error!(error = ?e, "frontier worker failed"),
    }
    result
}
