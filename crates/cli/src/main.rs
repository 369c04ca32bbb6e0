use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use kvsync_controller::{ControllerConfig, ReconcileController};
use kvsync_core::{flatten, nest, parse_document, ParseLimits};
use kvsync_kubehub::{ConsulKV, KubeResources};
use kvsync_store::{ConsulStore, StoreClient, StoreConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kvsyncctl", version, about = "Sync ConsulKV resources into Consul KV")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(long = "consul-host", env = "CONSUL_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long = "consul-port", env = "CONSUL_PORT", default_value_t = 8500)]
    port: u16,
    #[arg(long = "consul-scheme", env = "CONSUL_SCHEME", default_value = "http")]
    scheme: String,
    /// ACL token
    #[arg(long = "consul-token", env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long = "consul-datacenter", env = "CONSUL_DATACENTER")]
    datacenter: Option<String>,
    /// Per-request timeout
    #[arg(long = "consul-timeout-ms", env = "CONSUL_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        StoreConfig {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: self.port,
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Args, Debug)]
struct LimitArgs {
    /// Reject spec documents larger than this many bytes
    #[arg(long = "max-doc-bytes", env = "KVSYNC_MAX_DOC_BYTES", default_value_t = ParseLimits::default().max_bytes)]
    max_bytes: usize,
    /// Reject spec documents with more nodes than this
    #[arg(long = "max-doc-nodes", env = "KVSYNC_MAX_DOC_NODES", default_value_t = ParseLimits::default().max_nodes)]
    max_nodes: usize,
}

impl LimitArgs {
    fn limits(&self) -> ParseLimits { ParseLimits { max_bytes: self.max_bytes, max_nodes: self.max_nodes } }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator against the current kube context
    Run {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        limits: LimitArgs,
        /// Only watch this namespace (default: all namespaces)
        #[arg(long = "ns", env = "KVSYNC_NAMESPACE")]
        namespace: Option<String>,
        /// Seconds between cycles of a healthy resource
        #[arg(long = "requeue-secs", env = "KVSYNC_REQUEUE_SECS", default_value_t = 60)]
        requeue_secs: u64,
        /// Seconds before retrying a failed cycle
        #[arg(long = "error-requeue-secs", env = "KVSYNC_ERROR_REQUEUE_SECS", default_value_t = 5)]
        error_requeue_secs: u64,
    },
    /// Print the store keys a document flattens to
    Flatten {
        /// YAML file, or "-" for stdin
        file: String,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Read every key below a store prefix back into a nested YAML document
    Export {
        /// Key prefix, e.g. "app/"
        prefix: String,
        /// Write to this file instead of stdout
        #[arg(long = "out")]
        out: Option<PathBuf>,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print the ConsulKV CustomResourceDefinition
    Crd,
}

fn init_tracing() {
    let env = std::env::var("KVSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KVSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { store, limits, namespace, requeue_secs, error_requeue_secs } => {
            init_metrics();
            let store_cfg = store.config();
            info!(consul = %store_cfg.address(), ns = ?namespace, requeue_secs, "run invoked");
            let consul = ConsulStore::new(&store_cfg).context("configuring consul client")?;
            let client = kube::Client::try_default().await.context("connecting to kubernetes")?;
            let cfg = ControllerConfig {
                requeue_after: Duration::from_secs(requeue_secs),
                error_requeue_after: Duration::from_secs(error_requeue_secs),
                limits: limits.limits(),
            };
            let controller = ReconcileController::new(Arc::new(KubeResources::new(client.clone())), Arc::new(consul), cfg);
            kvsync_controller::run(client, Arc::new(controller), namespace).await;
        }
        Commands::Flatten { file, limits } => {
            let text = read_input(&file)?;
            let doc = parse_document(&text, &limits.limits()).with_context(|| format!("parsing {}", file))?;
            let set = flatten(&doc);
            match cli.output {
                Output::Human => {
                    for e in set.iter() {
                        println!("{} = {}", e.path, e.value);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&set)?),
            }
        }
        Commands::Export { prefix, out, store } => {
            let consul = ConsulStore::new(&store.config()).context("configuring consul client")?;
            info!(consul = %consul.identity(), prefix = %prefix, "export invoked");
            let pairs = consul.list(&prefix).await.with_context(|| format!("listing {}", prefix))?;
            let doc = nest(pairs, &prefix);
            let rendered = match cli.output {
                Output::Human => serde_yaml::to_string(&doc)?,
                Output::Json => serde_json::to_string_pretty(&doc)?,
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "export written");
                }
                None => print!("{}", rendered),
            }
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ConsulKV::crd())?);
        }
    }

    Ok(())
}
