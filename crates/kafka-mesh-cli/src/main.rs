//! Kafka Mesh Proxy CLI
//!
//! Presents several upstream Kafka clusters to clients as a single broker,
//! routing topics to clusters by configurable forwarding rules.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_mesh_core::config::{LoggingConfig, ProxyConfig};
use kafka_mesh_core::metrics::MeshMetrics;
use kafka_mesh_core::network::ProxyListener;
use kafka_mesh_core::upstream::{TopicRouter, UpstreamConfiguration};

/// Kafka mesh proxy.
#[derive(Parser)]
#[command(name = "kafka-mesh-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the address advertised to clients in Metadata responses.
    #[arg(long)]
    advertised_address: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ProxyConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(advertised) = args.advertised_address {
        config.listen.advertised_address = Some(advertised);
    }

    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    // Overrides can invalidate a config that loaded fine
    let router = TopicRouter::from_config(&config).context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        advertised = %config.listen.get_advertised_address(),
        clusters = config.upstream.clusters.len(),
        forwarding_rules = config.upstream.forwarding_rules.len(),
        "starting kafka mesh proxy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_proxy(config, router).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_proxy(config: ProxyConfig, router: TopicRouter) -> anyhow::Result<()> {
    let metrics = Arc::new(MeshMetrics::new());

    for cluster in &config.upstream.clusters {
        info!(
            cluster = %cluster.name,
            bootstrap_servers = ?cluster.bootstrap_servers,
            partition_count = cluster.partition_count,
            "upstream cluster"
        );
    }

    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let configuration: Arc<dyn UpstreamConfiguration> = Arc::new(router);
    let listener = ProxyListener::new(config, configuration, metrics);
    let shutdown_handle = listener.shutdown_handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping proxy");
        let _ = shutdown_handle.send(());
    });

    listener.run().await?;

    info!("proxy shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Serve `GET /metrics` in Prometheus text format. Other paths get 404.
async fn start_metrics_server(
    addr: &str,
    metrics: Arc<MeshMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Full::new(Bytes::new()));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, hyper::Error>(response);
                    }
                    let body = metrics.encode().unwrap_or_default();
                    Ok(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
