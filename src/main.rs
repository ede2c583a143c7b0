use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::CustomResourceExt;
use review_operator::config::OperatorConfig;
use review_operator::controller::{review_cluster_workflow, Backoff, Controller, KubeStore, ObjectStore};
use review_operator::crd::ReviewCluster;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Print the ReviewCluster CRD as YAML
    Crd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when empty
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "")]
    namespace: String,

    /// Reconcile workers
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Dependents evaluated concurrently within one pass
    #[arg(long, env = "MAX_CONCURRENT_DEPENDENTS", default_value_t = 4)]
    max_concurrent_dependents: usize,

    /// Minimum requeue backoff in seconds
    #[arg(long, env = "BACKOFF_MIN_SECS", default_value_t = 1)]
    backoff_min_secs: u64,

    /// Maximum requeue backoff in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Write attempts before a conflict is reported as an error
    #[arg(long, env = "CONFLICT_RETRIES", default_value_t = 3)]
    conflict_retries: u32,

    /// Resync interval in seconds after a successful pass; 0 disables
    #[arg(long, env = "RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Field manager and managed-by label value
    #[arg(long, env = "FIELD_MANAGER", default_value = "review-operator")]
    field_manager: String,

    /// Port of the REST API
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Skip leader election (single replica deployments and local runs)
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            workers: self.workers,
            max_concurrent_dependents: self.max_concurrent_dependents,
            backoff: Backoff::new(
                Duration::from_secs(self.backoff_min_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
            conflict_retries: self.conflict_retries,
            resync: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            field_manager: self.field_manager.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("review-operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ReviewCluster::crd())?);
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == LogFormat::Json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    let scope = if args.namespace.is_empty() {
        "all namespaces"
    } else {
        args.namespace.as_str()
    };
    info!(
        "Starting review-operator v{} (watching {})",
        env!("CARGO_PKG_VERSION"),
        scope
    );

    let config = args.operator_config();
    config.validate()?;

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let store: Arc<dyn ObjectStore> =
        Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));

    let controller = Arc::new(Controller::<ReviewCluster>::new(
        Arc::clone(&store),
        review_cluster_workflow()?,
        config.clone(),
    )?);

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::new(review_operator::rest_api::ApiState {
            store: Arc::clone(&store),
            parent: kube::api::ApiResource::erase::<ReviewCluster>(&()),
            namespace: config.namespace.clone(),
        });
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.api_port));
        tokio::spawn(async move {
            if let Err(e) = review_operator::rest_api::run_server(api_state, addr).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    if !args.disable_leader_election {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let is_leader = Arc::new(AtomicBool::new(false));
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let leases: Api<Lease> = Api::namespaced(client.clone(), &lease_namespace);
        {
            let leases = leases.clone();
            let is_leader = Arc::clone(&is_leader);
            let identity = holder_identity.clone();
            tokio::spawn(async move {
                run_leader_election(leases, &identity, is_leader).await;
            });
        }

        while !is_leader.load(Ordering::Relaxed) {
            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested before acquiring leadership");
                    return Ok(());
                }
            }
        }
    }

    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    Ok(())
}

const LEASE_NAME: &str = "review-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(leases: Api<Lease>, identity: &str, is_leader: Arc<AtomicBool>) {
    loop {
        match try_acquire_or_renew(&leases, identity).await {
            Ok(true) => {
                if !is_leader.load(Ordering::Relaxed) {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    // Another replica is reconciling now; stop before writing.
                    error!("Lost leadership for lease {}, exiting", LEASE_NAME);
                    std::process::exit(1);
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(leases: &Api<Lease>, identity: &str) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get_opt(LEASE_NAME).await? {
        Some(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(duration as i64)
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!("Lease held by {:?} has expired, taking over", current_holder);
            // Guard the takeover with the resource version we judged expired.
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": existing.metadata.resource_version },
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            match leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!("Created lease {} with holder {}", LEASE_NAME, identity);
                    Ok(true)
                }
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
    }
}
