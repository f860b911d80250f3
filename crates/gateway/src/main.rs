//! Gateway service entry point.

use anyhow::Result;
use gateway::{Service, ServiceConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env();
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");

    info!(?config, metrics_port, "starting gateway service");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");

    let service = Service::connect(config).await?;

    // Run until asked to stop, then drain the cache.
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    info!("shutdown signal received");
    service.stop();
    info!("gateway stopped");
    Ok(())
}
