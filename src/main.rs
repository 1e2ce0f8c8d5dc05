use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use metrics_operator::config::{FeatureGates, OperatorConfig};
use metrics_operator::controller::{self, OperatorState};
use metrics_operator::{server, Error};
use tokio::sync::watch;
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
    /// Show version and build information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Only handle objects whose controller-id annotation has this value
    #[arg(long, env = "CONTROLLER_ID", default_value = "")]
    controller_id: String,

    /// Feature gates, as a comma-separated list of name=bool pairs
    #[arg(long, env = "FEATURE_GATES", default_value = "")]
    feature_gates: String,

    /// Seconds between two status sweeps of unavailable workloads
    #[arg(long, env = "STATUS_POLL_INTERVAL", default_value_t = 60)]
    status_poll_interval: u64,

    /// Address of the metrics and probe endpoints
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn operator_config(&self) -> Result<OperatorConfig, Error> {
        if self.status_poll_interval == 0 {
            return Err(Error::ConfigError(
                "status poll interval must be greater than 0".to_string(),
            ));
        }

        Ok(OperatorConfig {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            controller_id: self.controller_id.clone(),
            feature_gates: FeatureGates::parse(&self.feature_gates)?,
            status_poll_interval: Duration::from_secs(self.status_poll_interval),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("metrics-operator v{}", env!("CARGO_PKG_VERSION"));
            for line in FeatureGates::default().descriptions() {
                println!("  feature gate {line}");
            }
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    let config = args.operator_config()?;
    info!(
        feature_gates = %config.feature_gates,
        "Starting metrics-operator v{}",
        env!("CARGO_PKG_VERSION")
    );
    if config.namespace.is_none() {
        warn!("No namespace set, watching all namespaces");
    }

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let state = Arc::new(OperatorState::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(server::run_server(
        args.metrics_addr,
        state.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = controller::run_operator(client, config, state, shutdown_rx).await;
    match &result {
        Ok(()) => match server.await {
            Ok(Err(e)) => error!("HTTP server failed: {}", e),
            Err(e) => error!("HTTP server task failed: {}", e),
            Ok(Ok(())) => {}
        },
        Err(e) => {
            error!("Operator failed: {}", e);
            // No shutdown was signalled, so the server would run forever.
            server.abort();
        }
    }

    info!("metrics-operator stopped");
    result
}
