use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use trellis_common::{Error, Result};
use trellis_config::AppConfig;

use crate::bootstrap::{build_scheduler, prepare_datasources};
use crate::router::build_router;
use crate::state::AppState;

/// Migrates the datastores, then binds and serves the HTTP + WebSocket API.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);

        // Migrations block on the lock and on SQLite, keep them off the runtime.
        let config = self.config.clone();
        let datasources = tokio::task::spawn_blocking(move || prepare_datasources(&config))
            .await
            .map_err(|e| Error::Gateway(format!("startup task failed: {e}")))??;

        let scheduler = build_scheduler(&self.config)?;
        let state = Arc::new(AppState::new(self.config, Arc::new(datasources))?);
        let app = build_router(state);

        let listener = TcpListener::bind(&addr).await?;
        info!("trellis listening on {}", addr);
        let _jobs = scheduler.start();

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Gateway(format!("server error: {e}")))?;

        Ok(())
    }
}
