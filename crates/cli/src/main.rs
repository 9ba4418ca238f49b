use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nodegate", version, about = "Keeps a DaemonSet's node-affinity in sync with foreign pod placement")]
struct Cli {
    /// Target namespace
    #[arg(long = "namespace")]
    namespace: String,

    /// Target DaemonSet name
    #[arg(long = "daemonset-name")]
    daemonset_name: String,

    /// Watch retry interval in seconds (length of one watch window)
    #[arg(long = "retry-interval", default_value_t = 60)]
    retry_interval: u64,

    /// Max refresh interval in seconds (forced recompute when idle this long)
    #[arg(long = "refresh-interval", default_value_t = 1200)]
    refresh_interval: u64,
}

fn init_tracing() {
    let env = std::env::var("NODEGATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NODEGATE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid NODEGATE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    // Bootstrap failures exit nonzero before the loop ever starts.
    let client = nodegate_kubehub::bootstrap_client()?;
    let hub = nodegate_kubehub::KubeHub::new(client);
    let controller = nodegate_sync::Controller::new(
        hub,
        cli.namespace.clone(),
        cli.daemonset_name.clone(),
        Duration::from_secs(cli.retry_interval),
        Duration::from_secs(cli.refresh_interval),
    )
    .await?;

    info!(
        ns = %cli.namespace,
        daemonset = %cli.daemonset_name,
        retry_interval = cli.retry_interval,
        refresh_interval = cli.refresh_interval,
        "controller starting"
    );

    // The loop only ends by cancellation; Ctrl-C drops it mid-watch, which is
    // safe because every cluster read is bounded by the watch timeout.
    tokio::select! {
        res = controller.run() => res.map_err(Into::into),
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            Ok(())
        }
    }
}
