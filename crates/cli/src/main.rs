use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use annowatch_controller::{run_with_source, Controller, ControllerConfig, LogMatch, DEFAULT_ANNOTATION, DEFAULT_NAMESPACE};
use annowatch_kubehub::Informer;
use annowatch_store::Cache;
use anyhow::Result;
use clap::{ArgAction, Parser};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "annowatch", version, about = "Logs objects that carry a given annotation")]
struct Cli {
    /// Path to a kubeconfig file (default: in-cluster or ~/.kube/config)
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// GVK key, e.g. "apps/v1/Deployment" or "v1/ConfigMap"
    #[arg(long = "gvk", default_value = "apps/v1/Deployment")]
    gvk: String,

    /// Namespace to watch and reconcile
    #[arg(long = "ns", env = "ANNOWATCH_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Watch every namespace instead of --ns
    #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
    all_namespaces: bool,

    /// Annotation key that selects an object
    #[arg(long = "annotation", default_value = DEFAULT_ANNOTATION)]
    annotation: String,

    #[arg(long = "workers", default_value_t = 2)]
    workers: usize,

    /// Retries after the first failure before a key is dropped
    #[arg(long = "max-retries", default_value_t = 5)]
    max_retries: u32,

    /// Re-deliver every cached object this often; 0 disables
    #[arg(long = "resync-secs", default_value_t = 600)]
    resync_secs: u64,

    /// Give up if the initial listing takes longer than this
    #[arg(long = "sync-timeout-secs")]
    sync_timeout_secs: Option<u64>,
}

impl Cli {
    fn namespace(&self) -> Option<&str> {
        if self.all_namespaces || self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.as_str())
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace().map(str::to_string),
            annotation_key: self.annotation.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            sync_timeout: self.sync_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("ANNOWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ANNOWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ANNOWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace();
    info!(gvk = %cli.gvk, ns = ?ns, annotation = %cli.annotation, workers = cli.workers, "starting");

    let client = annowatch_kubehub::connect(cli.kubeconfig.as_deref()).await?;
    let stream = annowatch_kubehub::watch_stream(client, &cli.gvk, ns).await?;

    let cache = Arc::new(Cache::new());
    let mut informer = Informer::new(cli.gvk.clone(), Arc::clone(&cache)).with_resync(Duration::from_secs(cli.resync_secs));
    let controller = Controller::new(
        cli.controller_config(),
        cache,
        informer.sync_waiter(),
        Arc::new(LogMatch::new(cli.annotation.clone())),
    );
    informer.add_event_handler(controller.event_handler());

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received; shutting down"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
            }
            stop.cancel();
        }
    });

    if let Err(e) = run_with_source(informer, stream, &controller, stop).await {
        error!(error = %e, "controller did not start");
        return Err(e.into());
    }
    info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_watch_deployments_in_default_namespace() {
        let cli = Cli::try_parse_from(["annowatch"]).expect("parse");
        assert_eq!(cli.gvk, "apps/v1/Deployment");
        let cfg = cli.controller_config();
        assert_eq!(cfg.namespace.as_deref(), Some("default"));
        assert_eq!(cfg.annotation_key, DEFAULT_ANNOTATION);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.sync_timeout, None);
        assert_eq!(cli.resync_secs, 600);
    }

    #[test]
    fn all_namespaces_clears_scope() {
        let cli = Cli::try_parse_from(["annowatch", "-A", "--ns", "prod", "--sync-timeout-secs", "30"]).expect("parse");
        let cfg = cli.controller_config();
        assert_eq!(cfg.namespace, None);
        assert_eq!(cfg.sync_timeout, Some(Duration::from_secs(30)));
    }
}
