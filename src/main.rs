use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kmm_operator::{config::OperatorConfig, controller, webhook::WebhookServer, Error};
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
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator configuration file (YAML)
    #[arg(long, env = "KMM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Do not serve the admission webhook
    #[arg(long, env = "DISABLE_WEBHOOK")]
    disable_webhook: bool,

    /// Overrides `worker.image` from the configuration file
    #[arg(long, env = "WORKER_IMAGE")]
    worker_image: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("KMM Operator v{}", env!("CARGO_PKG_VERSION"));
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
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);
    kmm_operator::install_crypto_provider();

    info!("Starting KMM Operator v{}", env!("CARGO_PKG_VERSION"));

    let mut config = OperatorConfig::load(args.config.as_deref())?;
    if let Some(image) = args.worker_image {
        config.worker.image = image;
    }
    if args.disable_webhook {
        config.webhook.enabled = false;
    }

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    if config.webhook.enabled {
        let webhook_config = config.webhook.clone();
        tokio::spawn(async move {
            let mut server = WebhookServer::new(webhook_config.bind_address);
            if webhook_config.cert_path().exists() {
                server = server.with_tls(webhook_config.cert_path(), webhook_config.key_path());
            } else {
                warn!(
                    "No certificate in {}, serving the webhook without TLS",
                    webhook_config.cert_dir.display()
                );
            }
            if let Err(e) = server.start().await {
                error!("Webhook server error: {:?}", e);
            }
        });
    }

    #[cfg(feature = "metrics")]
    {
        let addr = config.metrics.bind_address;
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr).await {
                error!("Metrics server error: {:?}", e);
            }
        });
    }

    let state = Arc::new(controller::ControllerState::new(client, config));

    let (build_sign, module_nmc, node_modules) = tokio::join!(
        controller::run_build_sign_controller(state.clone()),
        controller::run_module_nmc_controller(state.clone()),
        controller::run_node_modules_controller(state),
    );

    build_sign?;
    module_nmc?;
    node_modules?;

    info!("Controllers stopped, shutting down");
    Ok(())
}

#[cfg(feature = "metrics")]
async fn serve_metrics(addr: std::net::SocketAddr) -> Result<(), Error> {
    use axum::{http::StatusCode, routing::get, Router};

    async fn metrics_handler() -> (StatusCode, String) {
        match controller::metrics::render() {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;
    info!("Serving metrics on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Metrics server error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let args = Args::try_parse_from([
            "kmm-operator",
            "run",
            "--log-format",
            "json",
            "--disable-webhook",
            "--worker-image",
            "registry.local/worker:v1",
        ])
        .unwrap();

        let Commands::Run(run) = args.command else {
            panic!("expected run");
        };
        assert!(matches!(run.log_format, LogFormat::Json));
        assert!(run.disable_webhook);
        assert_eq!(run.worker_image.as_deref(), Some("registry.local/worker:v1"));
    }

    #[test]
    fn namespace_flag_is_not_accepted() {
        assert!(Args::try_parse_from(["kmm-operator", "run", "--namespace", "kmm-system"]).is_err());
    }
}
