use std::sync::Arc;
use tracing::info;

use courier::api::{self, AppState};
use courier::config::Config;
use courier::inbox::Inbox;
use courier::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file; not fatal if missing, but good to know.
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv_result {
        info!("No .env file found or failed to load: {}", e);
    }

    info!("Courier daemon starting...");

    let config = Config::from_env()?;

    info!("Initializing store at {}", config.database_path.display());
    let store = Store::new(&config.database_path).await?;
    store.init().await?;

    let state = Arc::new(AppState::new(store, Inbox::new()));
    let app = api::router(state);

    info!("Listening on port {}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
