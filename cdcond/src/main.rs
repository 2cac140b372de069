//! Main entry point for the connector daemon

use anyhow::Result;
use axum::{routing::get, Router};
use cdcon::config::Settings;
use cdcon::health::{self, AmqpComponent, HealthHandler, MongoComponent};
use cdcon::metrics::Metrics;
use cdcon::ConnectorServer;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// MongoDB change-data-capture connector daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (YAML)
    #[arg(short, long, default_value = "/app/config.yaml")]
    config: String,
    /// Prefix for environment variables
    #[arg(short, long, default_value = "CDCON")]
    prefix: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_env(format!("{}_LOG", cli.prefix)))
        .init();

    dotenv::dotenv().ok();

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&cli.config))
        .add_source(config::Environment::with_prefix(&cli.prefix).separator("__"))
        .build()?
        .try_deserialize::<Settings>()?;
    settings.validate()?;

    let metrics = Metrics::new();
    let shutdown = CancellationToken::new();

    let (mongo_client, rabbitmq_client) = ConnectorServer::connect_clients(&settings).await?;

    let health_handler = Arc::new(
        HealthHandler::new(vec![
            Box::new(MongoComponent::new(mongo_client.clone())),
            Box::new(AmqpComponent::new(rabbitmq_client.clone())),
        ])
        .strict(settings.http().strict_health),
    );

    let metrics_for_api = metrics.clone();
    let metrics_handler = move || async move {
        metrics_for_api
            .export()
            .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)
    };

    let app = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(health_handler);

    let listener = tokio::net::TcpListener::bind(&settings.http().addr).await?;
    info!(addr = %settings.http().addr, "HTTP server listening");
    let http_shutdown = shutdown.clone();
    let http_api = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    let server = ConnectorServer::with_metrics(settings, metrics);
    server
        .serve(mongo_client, rabbitmq_client, shutdown.clone())
        .await?;

    // All watchers are done; take the HTTP server down with us.
    shutdown.cancel();
    http_api.await??;
    Ok(())
}
