use axum::{routing::get, Router};
use mail_relay::{
    config::{Config, ObservabilityConfig},
    messaging::{connector_from_config, BrokerBackend, ConsumerSettings, LoggingHandler, QueueConsumer},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(&config.observability);
    config.validate()?;

    tracing::info!("Starting mail relay consumer v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        broker = %config.broker.redacted_url(),
        queue = %config.broker.queue,
        "Broker configuration"
    );

    // Initialize Prometheus metrics
    if config.observability.metrics_enabled {
        if let Err(e) = mail_relay::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
            tracing::warn!("Continuing without metrics");
        } else if let Some(port) = config.observability.metrics_port {
            spawn_metrics_server(port).await?;
        }
    } else {
        tracing::info!("Prometheus metrics disabled in configuration");
    }

    if config.broker.backend == BrokerBackend::InMemory {
        tracing::warn!("In-memory broker selected: only messages published by this process are visible");
    }

    let connector = connector_from_config(&config.broker)?;
    let consumer = QueueConsumer::new(
        connector,
        LoggingHandler,
        ConsumerSettings::from(&config.broker),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    tracing::info!("Press Ctrl+C to shutdown");
    let summary = consumer.run(shutdown).await;

    tracing::info!(
        sessions = summary.sessions_opened,
        acknowledged = summary.acknowledged,
        rejected = summary.rejected,
        "Shutting down gracefully..."
    );
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("mail_relay={0},mail_relay_consumer={0}", observability.log_level).into()
    });
    let json = observability.json_logs;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn spawn_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = Router::new().route("/metrics", get(|| async { mail_relay::metrics::gather_metrics() }));

    tracing::info!("Metrics endpoint listening on http://{}/metrics", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
    Ok(())
}
