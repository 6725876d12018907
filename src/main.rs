use reunion_relay::call::CallManager;
use reunion_relay::config::RelayConfig;
use reunion_relay::persistence::ObjectStoreGateway;
use reunion_relay::server::{self, AppState};
use reunion_relay::transport::{RestCredentialIssuer, WsConnector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> reunion_relay::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env()?;
    tracing::info!("Starting relay with {config:?}");

    let issuer = Arc::new(
        RestCredentialIssuer::new(&config.api_key, config.session.clone())?
            .with_base_url(config.api_url.clone())
            .with_fallback_ttl(config.token_ttl),
    );
    let connector = Arc::new(WsConnector::new(&config.ws_url, Some(config.session.model.as_str()))?);
    let persistence = Arc::new(ObjectStoreGateway::from_config(&config.storage)?);
    let manager = CallManager::new(config.call.clone(), issuer.clone(), connector, persistence);

    let app = server::router(AppState {
        manager,
        issuer,
        media_timeout: config.media_timeout,
    });

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!("Relay listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    tracing::info!("Shutting down");
}
