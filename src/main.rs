//! McuBridge daemon - bridges an MCU serial link to an MQTT 5 broker.
//!
//! This is the binary entry point. See the `mcubridge` library for the
//! actual bridge machinery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use mcubridge::mqtt::client as mqtt_client;
use mcubridge::serial::transport;
use mcubridge::{
    BridgeService, Config, MqttPublishSpool, PublishQueue, RuntimeState, SerialFlowController,
};

#[derive(Parser)]
#[command(name = "mcubridge")]
#[command(version)]
#[command(about = "Serial MCU to MQTT 5 bridge daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon.
    Start {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate the configuration and print the effective values.
    CheckConfig {
        /// Path to the JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { config } => run_daemon(config.as_deref()),
        Commands::CheckConfig { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_daemon(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = Arc::new(Config::load(config_path)?);
    log::info!(
        "Starting mcubridge v{} (serial={}, broker={}:{})",
        env!("CARGO_PKG_VERSION"),
        config.serial_port,
        config.mqtt_host,
        config.mqtt_port
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run_bridge(config))
}

async fn run_bridge(config: Arc<Config>) -> Result<()> {
    let state = Arc::new(std::sync::Mutex::new(RuntimeState::from_config(&config)));
    let spool = Arc::new(MqttPublishSpool::open(&config.mqtt_spool_dir, config.mqtt_spool_limit));
    let publish_queue = Arc::new(PublishQueue::new(config.mqtt_queue_limit));

    let timing = config.derive_serial_timing()?;
    let flow = Arc::new(SerialFlowController::new(
        timing.ack_timeout(),
        timing.response_timeout(),
        timing.retry_limit,
    ));

    let service = BridgeService::new(
        Arc::clone(&config),
        Arc::clone(&state),
        Arc::clone(&flow),
        Arc::clone(&publish_queue),
        Arc::clone(&spool),
    )?;

    let (mqtt, event_loop) = mqtt_client::create_client(&config)?;
    let shutdown = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(transport::run_serial_link(Arc::clone(&service), shutdown.clone()));
    tasks.spawn(mqtt_client::run_event_loop(
        event_loop,
        mqtt.clone(),
        Arc::clone(&service),
        shutdown.clone(),
    ));
    tasks.spawn(mqtt_client::run_publisher(mqtt, Arc::clone(&service), shutdown.clone()));

    if config.bridge_summary_interval > 0.0 {
        tasks.spawn(run_snapshot_task(
            Arc::clone(&service),
            "summary",
            config.bridge_summary_interval,
            shutdown.clone(),
        ));
    }
    if config.bridge_handshake_interval > 0.0 {
        tasks.spawn(run_snapshot_task(
            Arc::clone(&service),
            "handshake",
            config.bridge_handshake_interval,
            shutdown.clone(),
        ));
    }

    // Cooperative shutdown on SIGINT/SIGTERM.
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(err) => {
                        log::error!("Cannot install SIGTERM handler: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
                () = terminate => log::info!("SIGTERM received"),
                () = shutdown.cancelled() => return,
            }
            shutdown.cancel();
        });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            if !err.is_cancelled() {
                log::error!("Bridge task failed: {err}");
            }
        }
        // First task to finish normally means shutdown is in progress.
        shutdown.cancel();
    }

    if service.has_fatal_handshake_failure() {
        anyhow::bail!(
            "MCU rejected the serial shared secret (reason={}). Verify the configured \
             serial_shared_secret matches the secret compiled into the MCU firmware.",
            service.handshake.fatal_reason().unwrap_or_default()
        );
    }

    log::info!("mcubridge stopped");
    Ok(())
}

async fn run_snapshot_task(
    service: Arc<BridgeService>,
    flavor: &'static str,
    interval: f64,
    shutdown: CancellationToken,
) {
    let period = Duration::from_secs_f64(interval.max(1.0));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(period) => {}
        }
        service.publish_bridge_snapshot(flavor, None).await;
    }
}
