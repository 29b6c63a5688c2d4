use std::sync::Arc;

use anyhow::Context;
use erdsync_relay::{
    admission::counter_store::MemoryCounterStore,
    auth::jwt::JwtAccessTokenService,
    config::{LogFormat, RelayConfig},
    server::{build_router, shutdown_signal, RelayServices},
    session::persistence::MemoryDiagramStore,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set ERDSYNC_RELAY_JWT_SECRET outside local development");
    }

    let jwt_service =
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?;
    let listen_addr = config.listen_addr;
    let services = RelayServices::build(
        config,
        Arc::new(jwt_service),
        Arc::new(MemoryCounterStore::default()),
        Arc::new(MemoryDiagramStore::default()),
    );
    let background = services.spawn_background_tasks();
    let app = build_router(&services);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {listen_addr}"))?;

    info!(listen_addr = %listen_addr, "starting relay server");

    let token = services.token.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await
        .context("relay server exited unexpectedly");

    services.shutdown().await;
    for handle in background {
        let _ = handle.await;
    }
    info!("relay server stopped");

    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
