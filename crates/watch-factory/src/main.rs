use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use watch_factory::logging;
use watch_factory::EventCallbacks;
use watch_factory::FactoryConfig;
use watch_factory::KindedObject;
use watch_factory::KubeTransport;
use watch_factory::ResourceKind;
use watch_factory::WatchFactory;

#[derive(Parser)]
#[command(about = "Watch cluster objects and log every delivered event")]
struct Args {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    kubeconfig: Option<PathBuf>,

    #[arg(long, help = "Namespace to watch (empty for all namespaces)")]
    namespace: Option<String>,

    #[arg(long, default_value = "12", help = "Resync interval in hours")]
    resync_hours: u64,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Resource kinds to watch, e.g. pods,services (default: all)"
    )]
    kinds: Vec<ResourceKind>,
}

struct LoggingCallbacks {
    kind: ResourceKind,
}

impl EventCallbacks for LoggingCallbacks {
    fn on_add(&self, obj: &KindedObject) {
        tracing::info!(kind = %self.kind, object = %obj.store_key(), "add");
    }

    fn on_update(&self, _old: Option<&KindedObject>, new: &KindedObject) {
        tracing::info!(kind = %self.kind, object = %new.store_key(), "update");
    }

    fn on_delete(&self, obj: &KindedObject) {
        tracing::info!(kind = %self.kind, object = %obj.store_key(), "delete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = FactoryConfig::new()
        .with_resync_interval(Duration::from_secs(args.resync_hours * 60 * 60));
    if !args.kinds.is_empty() {
        config = config.with_kinds(args.kinds.iter().copied());
    }
    if let Some(namespace) = &args.namespace {
        config = config.with_watch_namespace(namespace.clone());
    }
    if let Some(kubeconfig) = &args.kubeconfig {
        config = config.with_kubeconfig(kubeconfig.clone());
    }

    let stop = CancellationToken::new();
    let transport = KubeTransport::connect(&config, stop.clone())
        .await
        .map_err(|report| anyhow!("connecting to cluster: {report:?}"))?;
    let factory = WatchFactory::new(&config, &transport, stop.clone())
        .await
        .map_err(|report| anyhow!("starting watch factory: {report:?}"))?;

    for &kind in &config.kinds {
        factory
            .add_handler(kind, Box::new(LoggingCallbacks { kind }), None)
            .map_err(|report| anyhow!("registering {kind} handler: {report:?}"))?;
    }

    tracing::info!("watching; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    stop.cancel();
    factory.shutdown().await;

    Ok(())
}
