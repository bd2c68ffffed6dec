use reqwest::Client;
use tracing::debug;
use trellis_common::{Error, Result};
use trellis_config::ServiceConfig;
use url::Url;

/// Client for a named upstream HTTP service.
#[derive(Debug, Clone)]
pub struct HttpService {
    name: String,
    base: Url,
    http: Client,
}

impl HttpService {
    pub fn new(name: impl Into<String>, config: &ServiceConfig) -> Result<Self> {
        let name = name.into();
        let base = Url::parse(&config.address).map_err(|e| {
            Error::Config(format!(
                "service {name} has an invalid address {}: {e}",
                config.address
            ))
        })?;
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build client for {name}: {e}")))?;

        Ok(Self { name, base, http })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Url {
        &self.base
    }

    /// GET `path` relative to the service address and return the body text.
    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!("calling {} at {url}", self.name);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{} unreachable at {url}: {e}", self.name)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "{} returned status {status}: {body}",
                self.name
            )));
        }

        resp.text()
            .await
            .map_err(|e| Error::Upstream(format!("failed to read {} response: {e}", self.name)))
    }
}
