mod cluster;
mod collector;
mod config;
mod error;
mod export;
mod http;
mod kafka;
mod metrics;
mod scheduler;

use crate::cluster::CallLimits;
use crate::collector::CycleRunner;
use crate::config::{Config, ConfigSource};
use crate::export::remote_write::RemoteWriteSink;
use crate::export::{FanoutSink, MetricSink};
use crate::http::server::HttpServer;
use crate::kafka::RdKafkaConnector;
use crate::metrics::registry::MetricsRegistry;
use crate::scheduler::Scheduler;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kafka-lag-monitor")]
#[command(about = "Per-topic consumer group lag for every group on every configured Kafka cluster")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Starting kafka-lag-monitor");

    let config = Config::load(Some(&args.config))?;
    info!(
        clusters = config.clusters.len(),
        poll_interval = ?config.exporter.poll_interval,
        overlap_policy = ?config.exporter.overlap_policy,
        push = config.exporter.push.enabled,
        "Configuration loaded"
    );
    let exporter = config.exporter.clone();

    let registry = Arc::new(MetricsRegistry::new());

    let mut sinks: Vec<Arc<dyn MetricSink>> = vec![Arc::clone(&registry) as Arc<dyn MetricSink>];
    if exporter.push.enabled {
        info!(endpoint = %exporter.push.endpoint, "Pushing lag records to remote endpoint");
        sinks.push(Arc::new(RemoteWriteSink::new(&exporter.push)?));
    } else {
        warn!("Remote push disabled, lag is only served on /metrics");
    }

    let runner = CycleRunner::new(
        Arc::new(RdKafkaConnector::new(exporter.broker_timeout)),
        Arc::new(FanoutSink::new(sinks)),
        CallLimits::new(
            exporter.broker_timeout,
            exporter.max_broker_calls_per_cluster,
            exporter.max_offset_trackers_per_cluster,
        ),
    );
    let scheduler = Arc::new(Scheduler::new(
        runner,
        Arc::new(ConfigSource::new(&args.config, config)),
        Arc::clone(&registry),
        exporter.overlap_policy,
        exporter.max_concurrent_cycles,
        exporter.poll_interval,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let http_server =
        HttpServer::new(&exporter.http_host, exporter.http_port, Arc::clone(&registry))?;
    let shutdown_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!(error = %e, "HTTP server error");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(());

    let _ = server_handle.await;

    // The scheduler bounds its own wait for in-flight cycles.
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task failed");
    }

    info!("kafka-lag-monitor stopped");
    Ok(())
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
