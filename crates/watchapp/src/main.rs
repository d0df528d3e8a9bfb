//! Binary entry point (§2 "Component map", §5 "Runtime topology"): loads
//! config, builds every component, wires the pipeline's subscriptions onto
//! the event bus, and drives it all from a block producer until a signal
//! tells it to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use domain::{FeatureFlags, WatchedAddress};
use eventbus::Bus;
use flags::FeatureFlagHandle;
use pipeline::Pipeline;
use producer::BlockProducer;
use ratecache::{CoinMarketCapProvider, RateCache, RateCacheConfig};
use rpcclient::RpcClient;
use sharder::RendezvousSharder;
use sinks::{FileSink, KafkaSink, NatsSink, Sink, SinkRegistry, StdoutSink, WebhookSink};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use watch::{WatchIndex, WatchIndexHandle};

mod metrics;

#[derive(Parser)]
#[command(name = "watchapp")]
#[command(about = "Bitcoin watch-address activity monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor (default when no subcommand is given).
    Run,
    /// Verify the node RPC endpoint is reachable, then exit.
    Healthcheck,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;

    match runtime.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("watchapp: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    let _log_guard = logging::init(std::env::var("LOG_FILE").ok().as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Healthcheck => run_healthcheck(&config).await,
        Commands::Run => run_monitor(config).await,
    }
}

async fn run_healthcheck(config: &AppConfig) -> Result<i32> {
    let rpc = RpcClient::new(config.rpc_url.clone());
    match rpc.get_blockchain_info().await {
        Ok(info) => {
            info!(target: "watchapp", chain = %info.chain, blocks = info.blocks, "healthcheck.ok");
            Ok(0)
        }
        Err(err) => {
            error!(target: "watchapp", error = %err, "healthcheck.failed");
            Ok(2)
        }
    }
}

fn parse_network(app_env: &str) -> address::Network {
    match std::env::var("BITCOIN_NETWORK").unwrap_or_default().to_lowercase().as_str() {
        "testnet" => address::Network::Testnet,
        "signet" => address::Network::Signet,
        "regtest" => address::Network::Regtest,
        "mainnet" => address::Network::Mainnet,
        _ if app_env == "development" || app_env == "test" => address::Network::Regtest,
        _ => address::Network::Mainnet,
    }
}

fn load_watch_addresses(config: &AppConfig) -> Vec<WatchedAddress> {
    if let Ok(addresses) = watch::load_watch_file(&config.watch_addresses_file) {
        return addresses;
    }
    match &config.watch_addresses_csv {
        Some(csv) => watch::parse_watch_csv(csv),
        None => Vec::new(),
    }
}

fn build_sinks(config: &AppConfig) -> SinkRegistry {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    for kind in &config.sinks_enabled {
        match kind.as_str() {
            "stdout" => sinks.push(Box::new(StdoutSink)),
            "file" => {
                if let Some(path) = &config.sink_file_path {
                    sinks.push(Box::new(FileSink::new(path.clone())));
                }
            }
            "webhook" => {
                if let Some(webhook) = &config.sink_webhook {
                    sinks.push(Box::new(WebhookSink::new(
                        webhook.url.clone(),
                        webhook.headers.clone(),
                        webhook.max_retries,
                    )));
                }
            }
            "kafka" => sinks.push(Box::new(KafkaSink {
                brokers: config.sink_kafka_brokers.clone().unwrap_or_default(),
                topic: config.sink_kafka_topic.clone().unwrap_or_default(),
            })),
            "nats" => sinks.push(Box::new(NatsSink {
                url: config.sink_nats_url.clone().unwrap_or_default(),
                subject: config.sink_nats_subject.clone().unwrap_or_default(),
            })),
            other => error!(target: "watchapp", kind = other, "watchapp.unknown_sink_kind"),
        }
    }
    SinkRegistry::new(sinks)
}

/// Build the `WatchIndex` this worker is responsible for, per the
/// rendezvous assignment in `sharder` (C8): the match engine only ever
/// watches the addresses this fleet member owns.
fn build_sharded_index(sharder: &RendezvousSharder, addresses: Vec<WatchedAddress>) -> WatchIndex {
    let owned: Vec<WatchedAddress> = sharder
        .filter_watched(&addresses)
        .into_iter()
        .cloned()
        .collect();
    WatchIndex::build(&owned)
}

async fn run_monitor(config: AppConfig) -> Result<i32> {
    let network = parse_network(&config.app_env);
    let rpc = RpcClient::new(config.rpc_url.clone());

    let sharder = Arc::new(RendezvousSharder::new(
        config.worker_id.clone(),
        config.worker_members.clone(),
    ));
    info!(
        target: "watchapp",
        worker_id = sharder.self_id(),
        members = sharder.members().len(),
        "watchapp.sharder_ready"
    );

    let watch_handle = Arc::new(WatchIndexHandle::new(build_sharded_index(
        &sharder,
        load_watch_addresses(&config),
    )));
    {
        let sharder = sharder.clone();
        watch::spawn_reload_task(
            watch_handle.clone(),
            config.watch_addresses_file.clone(),
            Duration::from_millis(watch::DEFAULT_WATCH_RELOAD_MS),
            move |addresses| build_sharded_index(&sharder, addresses),
        );
    }

    let flags = Arc::new(FeatureFlagHandle::new(FeatureFlags {
        parse_raw_blocks: config.parse_raw_blocks,
        resolve_input_addresses: config.resolve_input_addresses,
    }));
    if let Some(path) = config.feature_flags_file.clone() {
        flags::spawn_reload_task(flags.clone(), path, Duration::from_millis(config.feature_flags_reload_ms));
    }

    let provider: Arc<dyn ratecache::RateProvider> = Arc::new(CoinMarketCapProvider::new(
        config.coinmarketcap_api_key.clone().unwrap_or_default(),
    ));
    let ratecache = Arc::new(RateCache::new(
        RateCacheConfig {
            base_ttl: config.rate_cache.validity_period,
            ttl_jitter: config.rate_cache.ttl_jitter,
            negative_ttl: config.rate_cache.negative_ttl,
            cb_failure_threshold: config.rate_cache.cb_failure_threshold,
            cb_open_window: config.rate_cache.cb_open_window,
            ..RateCacheConfig::default()
        },
        provider,
    ));

    let sinks = Arc::new(build_sinks(&config));
    let bus = Bus::new(config.max_event_queue_size);

    let pipeline = Arc::new(Pipeline::new(
        bus.clone(),
        rpc.clone(),
        watch_handle,
        flags,
        ratecache,
        sinks,
        network,
    ));
    pipeline.register().await;
    let runtime_metrics = Arc::new(metrics::Metrics::default());
    metrics::install(&bus, runtime_metrics, Duration::from_secs(60)).await;
    bus.start().await;

    let producer = Arc::new(BlockProducer::new(bus.clone(), rpc, config.poll_interval));
    let cancel = CancellationToken::new();

    let producer_task = {
        let producer = producer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(cancel).await })
    };

    wait_for_shutdown_signal().await;
    info!(target: "watchapp", "watchapp.shutting_down");
    cancel.cancel();
    let _ = producer_task.await;
    bus.wait_until_idle().await;
    bus.shutdown().await;

    Ok(0)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
