use std::sync::Arc;

use axum::Router;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stacktask::{
    config::Config,
    db::connect_and_bootstrap,
    delivery::start_delivery_worker,
    handlers::router,
    identity::{IdentityGateway, InMemoryIdentity},
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stacktask=info")),
        )
        .json()
        .init();

    let config = Config::from_env()?;
    let db = connect_and_bootstrap(&config).await?;

    let identity = match config.identity_fixture_path.as_deref() {
        Some(path) => InMemoryIdentity::from_fixture_file(path)?,
        None => InMemoryIdentity::new(),
    };
    let gateway: Arc<dyn IdentityGateway> = Arc::new(identity);

    let state = AppState::new(config.clone(), db, gateway)?;

    start_delivery_worker(state.clone());

    let app: Router = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "stacktask listening");

    axum::serve(listener, app).await?;
    Ok(())
}
