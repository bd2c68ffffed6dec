use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use trellis_common::{Error, Result};
use trellis_config::AppConfig;
use trellis_db::Datasources;

use crate::upstream::HttpService;

/// Shared application state accessible from all request handlers.
pub struct AppState {
    pub config: AppConfig,
    pub datasources: Arc<Datasources>,
    services: HashMap<String, HttpService>,
}

impl AppState {
    /// Build the upstream clients named in `config.services`.
    pub fn new(config: AppConfig, datasources: Arc<Datasources>) -> Result<Self> {
        let services = config
            .services
            .iter()
            .map(|(name, svc)| {
                info!("registered service {name} at {}", svc.address);
                HttpService::new(name.clone(), svc).map(|client| (name.clone(), client))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            config,
            datasources,
            services,
        })
    }

    pub fn service(&self, name: &str) -> Result<&HttpService> {
        self.services
            .get(name)
            .ok_or_else(|| Error::Config(format!("service {name} is not configured")))
    }

    /// Run blocking datastore work off the async runtime.
    pub async fn with_datasources<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Datasources) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let datasources = Arc::clone(&self.datasources);
        tokio::task::spawn_blocking(move || f(&datasources))
            .await
            .map_err(|e| Error::Gateway(format!("datastore task failed: {e}")))?
    }
}

pub type SharedState = Arc<AppState>;
