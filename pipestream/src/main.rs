mod handler;

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, Instrument};

use pipestream_core::{
    bootstrap::{load_config, load_config_from},
    logging, Config,
};
use pipestream_data::DataServer;
use pipestream_streaming::{
    FlowPattern, StatisticsEvent, StatisticsSink, StreamingCoordinator, UpstreamChange,
};

use handler::NodeHandler;

#[derive(Parser, Debug)]
#[command(name = "pipestream")]
#[command(about = "Pipeline node streaming transport", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, env = "PIPESTREAM_CONFIG_PATH")]
    config: Option<String>,

    /// Node name, overrides node.name
    #[arg(long)]
    node_name: Option<String>,

    /// Streaming port, overrides streaming.port
    #[arg(long)]
    port: Option<u16>,
}

/// Unique id for this process, used in logs only
fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = nanoid::nanoid!(6);
    format!("{hostname}-{suffix}")
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(name) = &args.node_name {
        config.node.name.clone_from(name);
    }
    if let Some(port) = args.port {
        config.streaming.port = port;
    }
    config.validate().map_err(|errors| {
        anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        )
    })
}

fn spawn_statistics_logger() -> Arc<dyn StatisticsSink> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<StatisticsEvent>>();
    tokio::spawn(async move {
        while let Some(events) = rx.recv().await {
            for event in events {
                debug!(
                    node = %event.node_name,
                    consumer_type = %event.consumer_type,
                    sent = event.sent,
                    queue_size = event.queue_size,
                    responses = event.responses,
                    dropped = event.dropped,
                    durations = ?event.durations,
                    round_trips = ?event.round_trips,
                    "Producer statistics"
                );
            }
        }
    });
    Arc::new(tx)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = match args.config.as_deref() {
        Some(path) => load_config_from(Some(path))?,
        None => load_config()?,
    };
    apply_overrides(&mut config, &args)?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let span = info_span!("node", name = %config.node.name, instance = %generate_instance_id());
    run(config).instrument(span).await
}

async fn run(config: Config) -> Result<()> {
    info!("Pipestream node starting...");

    // 3. Data server
    let data_server = if config.data_server.enabled {
        let server = DataServer::listen(&config.data_server).await?;
        info!(address = %server.local_addr(), "Data server enabled");
        Some(Arc::new(server))
    } else {
        None
    };

    // 4. Streaming
    let coordinator = StreamingCoordinator::new(config.node.name.clone(), config.streaming.clone())?;
    coordinator.set_inbound_handler(Arc::new(NodeHandler::new(
        config.node.relay,
        data_server.clone(),
    )));

    if !config.node.consumer_types.is_empty() {
        let flows: HashMap<String, FlowPattern> = config
            .node
            .flows
            .iter()
            .map(|(name, hops)| (name.clone(), FlowPattern::from(hops.as_slice())))
            .collect();
        let address = coordinator
            .setup_producer(
                &config.node.consumer_types,
                flows,
                config.node.default_flow.clone(),
                Some(spawn_statistics_logger()),
            )
            .await?;
        info!(address = %address, consumer_types = ?config.node.consumer_types, "Producer started");
    }

    let changes = config
        .node
        .upstreams
        .iter()
        .cloned()
        .map(UpstreamChange::Add)
        .collect();
    coordinator.setup_listeners(changes).await;
    coordinator.start_listening();
    info!(upstreams = config.node.upstreams.len(), "Listening to upstream producers");

    // 5. Wait for shutdown
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, draining...");

    coordinator.stop_streaming(false).await;
    if let Some(server) = data_server {
        server.wait_till_serving_is_done().await;
        server.close().await;
    }

    info!("Pipestream node stopped");
    Ok(())
}
