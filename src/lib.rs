pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod itemstore;
pub mod language;
pub mod logging;
pub mod matching;
pub mod mediawiki;
pub mod model;
pub mod monitoring;
pub mod path;
pub mod server;
pub mod sitelink;
pub mod sparql;
pub mod state;
pub mod subfields;
pub mod suggest;
pub mod typematcher;
pub mod value;

pub use config::{CliArgs, ServiceConfig};
pub use error::{Result, ServiceError};
pub use logging::{LoggingConfig, init_logging};
pub use server::router;
pub use state::AppState;

use std::sync::Arc;
use tokio::net::TcpListener;

/// Builds the state and serves the API until ctrl-c.
pub async fn run_server(config: ServiceConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let state = Arc::new(AppState::new(config.clone()).await?);

    let app = router(state);
    let listener = TcpListener::bind(config.bind_address).await?;
    let actual_addr = listener.local_addr()?;
    tracing::info!(bind = %actual_addr, instance = %config.mediawiki_api_endpoint, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
