use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fnstack_k8s::cache::CacheBuilder;
use fnstack_k8s::config::{DeploymentConfig, ImagePullPolicy, OperatorConfig};
use fnstack_k8s::controller::queue::WorkQueue;
use fnstack_k8s::controller::{run_reconciler, FunctionFactory, ReconcilerContext};
use fnstack_k8s::crd::Function;
use fnstack_k8s::metrics::PrometheusQuery;
use fnstack_k8s::rest_api::{self, ApiState, CustomResourceWriter, DirectWriter, WorkloadWriter};
use fnstack_k8s::router::FunctionLookup;
use fnstack_k8s::Error;
use kube::api::ListParams;
use kube::Api;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Manage Function custom resources instead of applying workloads
    /// directly from the REST API
    #[arg(long, env = "OPERATOR_MODE")]
    operator: bool,

    /// Namespace functions are deployed into
    #[arg(long, env = "FUNCTION_NAMESPACE", default_value = "default")]
    function_namespace: String,

    /// Namespace holding Profile resources
    #[arg(long, env = "PROFILES_NAMESPACE", default_value = "fnstack")]
    profiles_namespace: String,

    /// Watch every namespace instead of only the function namespace
    #[arg(long, env = "CLUSTER_SCOPE")]
    cluster_scope: bool,

    /// Port the provider REST API listens on
    #[arg(long, env = "PORT", default_value_t = 8081)]
    port: u16,

    /// Base URL of the Prometheus instance answering rate queries
    #[arg(long, env = "PROMETHEUS_URL", default_value = "http://prometheus:9090")]
    prometheus_url: String,

    /// Full re-list interval for the watch mirrors, in seconds
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// How long to wait for the initial cache sync, in seconds
    #[arg(long, env = "STARTUP_TIMEOUT_SECONDS", default_value_t = 60)]
    startup_timeout_seconds: u64,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Reconcile attempts per key before the function is marked Failed
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Port the function runtime listens on inside the container
    #[arg(long, env = "FUNCTION_PORT", default_value_t = 8080)]
    function_port: i32,

    /// Probe functions over HTTP instead of the exec lock-file fallback
    #[arg(long, env = "HTTP_PROBE", default_value_t = true, action = clap::ArgAction::Set)]
    http_probe: bool,

    /// Force function containers to run as the non-root user
    #[arg(long, env = "SET_NONROOT_USER")]
    set_nonroot_user: bool,

    /// Image pull policy for function containers
    #[arg(long, env = "IMAGE_PULL_POLICY", default_value = "Always")]
    image_pull_policy: String,

    /// Emit logs as JSON
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

impl RunArgs {
    fn to_config(&self) -> Result<OperatorConfig, Error> {
        Ok(OperatorConfig {
            function_namespace: self.function_namespace.clone(),
            profiles_namespace: self.profiles_namespace.clone(),
            cluster_scope: self.cluster_scope,
            resync_interval: Duration::from_secs(self.resync_seconds.max(1)),
            startup_timeout: Duration::from_secs(self.startup_timeout_seconds.max(1)),
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            port: self.port,
            prometheus_url: self.prometheus_url.clone(),
            deployment: DeploymentConfig {
                runtime_http_port: self.function_port,
                http_probe: self.http_probe,
                set_nonroot_user: self.set_nonroot_user,
                image_pull_policy: ImagePullPolicy::parse(&self.image_pull_policy)?,
                ..DeploymentConfig::default()
            },
            ..OperatorConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("fnstack-k8s v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.json_logs);

    let config = args.to_config()?;
    info!(
        operator = args.operator,
        namespace = %config.function_namespace,
        cluster_scope = config.cluster_scope,
        "starting fnstack-k8s v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("connected to Kubernetes cluster");

    if args.operator {
        ensure_crds_installed(&client, &config).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_on_signal(shutdown_tx));

    // Start the watch mirrors. Function and Profile mirrors only exist in
    // operator mode; the event subscriptions feed the reconciler.
    let mut builder = CacheBuilder::new(client.clone(), config.clone());
    let mut reconciler_events = None;
    if args.operator {
        builder = builder.with_functions();
        let function_events = builder.subscribe_functions();
        let deployment_events = builder.subscribe_deployments();
        reconciler_events = Some((function_events, deployment_events));
    }
    let cache = builder.start(shutdown_rx.clone()).await?;

    let factory = FunctionFactory::new(config.deployment.clone());
    let writer: Arc<dyn WorkloadWriter> = if args.operator {
        Arc::new(CustomResourceWriter::new(client.clone()))
    } else {
        Arc::new(DirectWriter::new(
            client.clone(),
            cache.clone(),
            factory.clone(),
        ))
    };

    let mut reconciler = None;
    if let Some((function_events, deployment_events)) = reconciler_events {
        let functions = cache
            .functions()
            .cloned()
            .ok_or_else(|| Error::ConfigError("function mirror did not start".to_string()))?;
        let ctx = Arc::new(ReconcilerContext {
            client: client.clone(),
            cache: cache.clone(),
            functions,
            factory: factory.clone(),
            queue: Arc::new(WorkQueue::new()),
            config: config.clone(),
        });
        reconciler = Some(tokio::spawn(run_reconciler(
            ctx,
            function_events,
            deployment_events,
            shutdown_rx.clone(),
        )));
    }

    let state = Arc::new(ApiState {
        client: client.clone(),
        cache: cache.clone(),
        lookup: FunctionLookup::new(
            cache.clone(),
            config.function_namespace.clone(),
            config.cluster_scope,
        ),
        writer,
        prometheus: PrometheusQuery::new(&config.prometheus_url)?,
        config: config.clone(),
        proxy_client: reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(Error::HttpError)?,
    });

    let result = rest_api::run_server(state, shutdown_rx).await;

    if let Some(reconciler) = reconciler {
        if let Err(e) = reconciler.await {
            error!("reconciler task panicked: {e}");
        }
    }

    result
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Fail fast when the CRDs are missing so the mirrors do not spin on 404s
async fn ensure_crds_installed(client: &kube::Client, config: &OperatorConfig) -> Result<(), Error> {
    let functions: Api<Function> = if config.cluster_scope {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &config.function_namespace)
    };

    match functions.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("Function CRD is available");
            Ok(())
        }
        Err(e) => {
            error!("Function CRD not found, install it first: cargo run --bin crdgen | kubectl apply -f -");
            Err(Error::KubeError(e))
        }
    }
}

/// Flip the shutdown signal on SIGINT or SIGTERM
async fn shutdown_on_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    let _ = tx.send(true);
}
