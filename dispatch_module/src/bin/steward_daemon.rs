use dispatch_module::config::resolve_config_path;
use dispatch_module::{run_server, BoxError, StewardConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config_path = resolve_config_path()?;
    let config_file = dispatch_module::config::load_config_file(&config_path)?;
    let config = StewardConfig::from_file(config_file)?;
    info!(
        "steward config path={}, name={}, host={}, port={}, events={}",
        config_path.display(),
        config.name,
        config.host,
        config.port,
        config.enabled_events.join(",")
    );

    run_server(config, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
