use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kubecat_catalog::{CatalogClient, GraphqlCatalog, DEFAULT_API_URL};
use kubecat_controller::{ControllerOptions, DEFAULT_BATCH_SIZE};
use kubecat_core::{sample, Config, ServiceRegistration};
use kubecat_expr::JqEvaluator;
use kubecat_kubehub::KubeSource;
use kubecat_reconcile::pool::DEFAULT_QUEUE_CAP;
use kubecat_reconcile::{ConflictPolicy, PoolSummary, ReconcileOptions, Reconciler, ReferenceCache};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod handler;

use app::Pipeline;

const SAMPLE_CONFIG: &str = include_str!("sample.yaml");

#[derive(Parser, Debug)]
#[command(name = "kubecatctl", version, about = "Import Kubernetes resources into a service catalog")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to the import configuration
    #[arg(long, global = true, env = "KUBECAT_CONFIG", default_value = "./kubecat.yaml")]
    config: String,

    /// jq binary used to evaluate expressions
    #[arg(long, global = true, env = "KUBECAT_JQ", default_value = "jq")]
    jq: String,

    /// Maximum objects handed to the handler per dispatch
    #[arg(long = "batch-size", global = true, env = "KUBECAT_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Args, Debug)]
struct CatalogArgs {
    /// Catalog GraphQL endpoint
    #[arg(long = "api-url", env = "KUBECAT_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Catalog API token
    #[arg(long = "api-token", env = "KUBECAT_API_TOKEN", hide_env_values = true, default_value = "")]
    api_token: String,

    /// Reconcile workers (default: available parallelism)
    #[arg(long, env = "KUBECAT_WORKERS")]
    workers: Option<usize>,

    /// Seconds between tier/lifecycle/team refreshes
    #[arg(long = "cache-refresh", env = "KUBECAT_CACHE_REFRESH_SECS", default_value_t = 3600)]
    cache_refresh: u64,

    /// Never create services; only update ones that already exist
    #[arg(long = "disable-service-create", action = ArgAction::SetTrue)]
    disable_service_create: bool,

    /// When several aliases match: distinct-services or any-match
    #[arg(long = "conflict-policy", default_value = "distinct-services", value_parser = ConflictPolicy::from_str)]
    conflict_policy: ConflictPolicy,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build registrations from the cluster without touching the catalog
    Preview {
        /// Print a random sample of this many registrations
        count: Option<usize>,
    },
    /// List every selector once and reconcile the results
    Import {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// Watch every selector and keep the catalog in sync until interrupted
    Reconcile {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// Seconds between full resyncs of cached objects
        #[arg(long, env = "KUBECAT_RESYNC_SECS", default_value_t = 3600)]
        resync: u64,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print a documented sample configuration
    Sample,
    /// Print the loaded configuration
    View,
}

fn init_tracing() {
    let env = std::env::var("KUBECAT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBECAT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KUBECAT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Config { command: ConfigCommands::Sample } => {
            print!("{}", SAMPLE_CONFIG);
            Ok(())
        }
        Commands::Config { command: ConfigCommands::View } => {
            let cfg = load_config(&cli)?;
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
        Commands::Preview { count } => preview(&cli, *count).await,
        Commands::Import { catalog } => {
            let pipeline = pipeline(&cli, None).await?;
            let (workers, _refs) = reconcilers(catalog).await?;
            let summary = pipeline.import(workers).await?;
            print_summary(cli.output, &summary)
        }
        Commands::Reconcile { catalog, resync } => {
            let resync = (*resync > 0).then(|| Duration::from_secs(*resync));
            let pipeline = pipeline(&cli, resync).await?;
            let (workers, refs) = reconcilers(catalog).await?;

            let cancel = CancellationToken::new();
            let refresher = refs.spawn_refresh(Duration::from_secs(catalog.cache_refresh.max(1)), cancel.clone());
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; shutting down");
                    on_signal.cancel();
                }
            });

            let res = pipeline.run(workers, cancel.clone()).await;
            cancel.cancel();
            let _ = refresher.await;
            let summary = res?;
            print_summary(cli.output, &summary)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config).with_context(|| format!("loading config {}", cli.config))
}

async fn pipeline(cli: &Cli, resync: Option<Duration>) -> Result<Pipeline> {
    let cfg = load_config(cli)?;
    let jq = JqEvaluator::locate(&cli.jq).with_context(|| format!("locating jq binary '{}'", cli.jq))?;
    let source = KubeSource::try_default().await?;
    let opts = ControllerOptions { batch_size: cli.batch_size, resync };
    let p = Pipeline::build(&cfg, &jq, Arc::new(source), opts, DEFAULT_QUEUE_CAP)?;
    if p.is_empty() {
        warn!(config = %cli.config, "no imports configured; nothing to watch");
    }
    Ok(p)
}

async fn reconcilers(args: &CatalogArgs) -> Result<(Vec<Reconciler>, Arc<ReferenceCache>)> {
    let connect = || -> Result<Arc<dyn CatalogClient>> {
        let client = GraphqlCatalog::new(&args.api_url, &args.api_token).context("building catalog client")?;
        Ok(Arc::new(client))
    };
    let refs = Arc::new(ReferenceCache::new(Arc::new(
        GraphqlCatalog::new(&args.api_url, &args.api_token).context("building catalog client")?,
    )));
    if let Err(e) = refs.refresh().await {
        warn!(error = %e, "initial reference data load failed; owner, tier and lifecycle will be omitted until a refresh succeeds");
    }
    let opts = ReconcileOptions {
        disable_service_create: args.disable_service_create,
        conflict_policy: args.conflict_policy,
    };
    let n = args
        .workers
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
        .max(1);
    let workers = app::workers(n, connect, &refs, opts)?;
    info!(workers = n, policy = %opts.conflict_policy, "reconcile workers ready");
    Ok((workers, refs))
}

async fn preview(cli: &Cli, count: Option<usize>) -> Result<()> {
    let regs = pipeline(cli, None).await?.preview().await?;
    let total = regs.len();
    let shown: Vec<ServiceRegistration> = match count {
        Some(n) => sample(n, &regs),
        None => regs,
    };
    match cli.output {
        Output::Yaml => print!("{}", serde_yaml::to_string(&shown)?),
        Output::Json | Output::Human => println!("{}", serde_json::to_string_pretty(&shown)?),
    }
    if cli.output == Output::Human {
        println!("showing {} of {} registrations", shown.len(), total);
    }
    Ok(())
}

fn print_summary(output: Output, s: &PoolSummary) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(s)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(s)?),
        Output::Human => println!(
            "reconciled {} (created {}, updated {}, unchanged {}, creation disabled {}, failed {}, sub-resource errors {})",
            s.reconciled, s.created, s.updated, s.unchanged, s.creation_disabled, s.failed, s.subresource_errors
        ),
    }
    Ok(())
}
