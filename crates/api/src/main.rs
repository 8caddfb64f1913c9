use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use filescan_api::app;
use filescan_api::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    filescan_observability::init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let services = Arc::new(app::services::build_services(config).await?);

    let shutdown = CancellationToken::new();
    app::services::spawn_retention(&services, shutdown.clone());

    let router = app::build_app(services);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        })
        .await?;

    Ok(())
}
