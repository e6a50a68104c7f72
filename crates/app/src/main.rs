//! Weft operator binary: argument parsing, tracing/metrics init, and the
//! fleet manager run loop.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use weft_manager::{FleetManager, FleetManagerConfig};

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Declarative function-composition runtime")]
struct Cli {
    /// Prometheus metrics bind address (disabled when omitted)
    #[arg(long = "metrics-bind-address")]
    metrics_addr: Option<SocketAddr>,

    /// Health probe bind address
    #[arg(long = "health-probe-bind-address", default_value = "0.0.0.0:8081")]
    probe_addr: SocketAddr,

    /// Enable leader election for this operator
    #[arg(long = "leader-elect", action = ArgAction::SetTrue)]
    leader_elect: bool,

    /// Unique identifier of this operator instance
    #[arg(long = "unique-id", default_value = "weft")]
    unique_id: String,

    /// Operator domain, the suffix of the leader-election lock id
    #[arg(long = "domain", default_value = "weft.dev")]
    domain: String,

    /// Reconcile workers per controller
    #[arg(long = "concurrency", default_value_t = 1)]
    concurrency: usize,

    /// Retry delay for failed reconciles, seconds
    #[arg(long = "poll-interval", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Worker RPCs in flight across all executions
    #[arg(long = "max-in-flight", default_value_t = 16)]
    max_in_flight: usize,

    /// Deadline for a single worker RPC, seconds
    #[arg(long = "request-timeout", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Configuration document names to manage (one controller each)
    #[arg(long = "config", required = true)]
    configs: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("WEFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr);

    let namespace = weft_core::operating_namespace();
    let wrapper_image = std::env::var(weft_core::ENV_WRAPPER_IMAGE)
        .unwrap_or_else(|_| weft_core::DEFAULT_WRAPPER_IMAGE.to_string());

    let client = kube::Client::try_default()
        .await
        .context("cannot build cluster client")?;

    let manager = FleetManager::new(
        FleetManagerConfig {
            namespace,
            config_names: cli.configs,
            probe_addr: cli.probe_addr,
            leader_election: cli.leader_elect,
            unique_id: cli.unique_id,
            domain: cli.domain,
            concurrency: cli.concurrency,
            poll_interval: Duration::from_secs(cli.poll_interval_secs),
            max_in_flight: cli.max_in_flight,
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            wrapper_image,
        },
        client,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = manager.run(cancel).await {
        error!(error = %e, "fleet manager failed");
        return Err(e);
    }
    Ok(())
}
