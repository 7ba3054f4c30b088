use corr_engine::{
    BroadcastHub, ConnectionSupervisor, Pipeline, PipelineEvent, run_pipeline, run_source,
};
use rustls::crypto::ring::default_provider;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{error, info};

use crate::{
    config::ServerConfig,
    source::{BinanceDecoder, BridgeDecoder, WebSocketSource},
};

mod config;
mod server;
mod source;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // WSS upstreams need a process-wide crypto provider
    let _ = default_provider().install_default();

    let config = ServerConfig::from_env().inspect_err(|error| {
        error!(%error, "invalid configuration");
    })?;
    let engine = config.engine.clone();
    let pair = engine.pair.clone();

    info!(
        symbol_a = %pair.symbol_a,
        symbol_b = %pair.symbol_b,
        bridge = %config.bridge_url,
        binance = %config.binance_url,
        "starting corr-server"
    );

    let pipeline = Pipeline::new(engine.clone())?;
    let hub = BroadcastHub::new(engine.throttle.clone());
    let (events_tx, events_rx) = mpsc::channel(engine.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline_task = tokio::spawn(run_pipeline(pipeline, events_rx, hub.clone()));

    let listener = TcpListener::bind(config.addr).await.inspect_err(|error| {
        error!(addr = %config.addr, %error, "failed to bind viewer server");
    })?;
    info!("viewer server listening on ws://{}", config.addr);
    let server_task = tokio::spawn(server::serve(listener, hub.clone(), shutdown_rx.clone()));

    let bridge = WebSocketSource::new(
        pair.source_a.clone(),
        config.bridge()?,
        BridgeDecoder::new(pair.source_a.clone(), pair.symbol_a.clone()),
    );
    let binance = WebSocketSource::new(
        pair.source_b.clone(),
        config.binance()?,
        BinanceDecoder::new(pair.source_b.clone(), pair.symbol_b.clone()),
    );

    let source_tasks = [
        tokio::spawn(run_source(
            bridge,
            ConnectionSupervisor::new(pair.source_a.clone(), engine.supervisor.clone()),
            events_tx.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_source(
            binance,
            ConnectionSupervisor::new(pair.source_b.clone(), engine.supervisor.clone()),
            events_tx.clone(),
            shutdown_rx,
        )),
    ];

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    for task in source_tasks {
        if let Err(error) = task.await {
            error!(%error, "tick source task failed");
        }
    }

    // Sources are stopped, so the pipeline sees every tick before the shutdown marker
    let _ = events_tx.send(PipelineEvent::Shutdown).await;
    match pipeline_task.await {
        Ok(pipeline) => info!(stats = ?pipeline.stats(), "pipeline drained"),
        Err(error) => error!(%error, "aggregation pipeline task failed"),
    }

    if let Err(error) = server_task.await {
        error!(%error, "viewer server task failed");
    }

    info!("corr-server stopped");
    Ok(())
}

/// Initialise logging. `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` selects JSON output.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
