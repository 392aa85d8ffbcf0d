use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use credential_broker::server::broker_routes;
use credential_broker::{BrokerConfig, MemorySessionStore, SecretStoreClient, spawn_reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = BrokerConfig::from_env().context("invalid broker configuration")?;

    info!(
        okta_authorize = %config.oauth.auth_url(),
        vault_addr = %config.vault.address,
        jwt_mount = %config.vault.jwt_mount,
        assertion_exchange = config.assertion.is_some(),
        bind = %config.bind_addr,
        "Starting credential broker"
    );

    let probe =
        SecretStoreClient::new(config.vault.clone()).context("failed to build HTTP client")?;
    if let Err(failure) = probe.verify_connectivity().await {
        warn!(%failure, "Secret store rejected the bootstrap credential or is unreachable");
    }

    let store = Arc::new(MemorySessionStore::new());
    let broker = config
        .build_broker(Arc::clone(&store))
        .context("failed to assemble broker")?;
    info!(signing = ?broker.signing_posture(), "Assertion signing ready");

    let _reaper = config.reaper_interval.map(|period| {
        info!(period_secs = period.as_secs(), "Session reaper enabled");
        spawn_reaper(Arc::clone(&store), period)
    });

    let app = broker_routes(Arc::new(broker), config.server.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
