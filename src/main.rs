use std::sync::Arc;

use dicom_relay::{config::AppConfig, logger::init_tracing, relay::Relay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    let cfg = AppConfig::from_env()?;

    tracing::info!(
        storage_dir = %cfg.storage_dir.display(),
        endpoint = %cfg.api_endpoint,
        idle_timeout_secs = cfg.idle_timeout_secs,
        delete_after_send = cfg.delete_after_send,
        encrypted = cfg.encryption_key_hex.is_some(),
        "starting dicom-relay"
    );

    let relay = Arc::new(Relay::from_config(&cfg)?);

    // TODO: attach the C-STORE SCP listener here; it calls
    // relay.handle_instance() per received instance and ACKs/NACKs the
    // exchange from the result.

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining");

    relay.shutdown(cfg.shutdown_grace()).await;
    tracing::info!("relay stopped");

    Ok(())
}
