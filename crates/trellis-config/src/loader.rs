use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use trellis_common::{Error, Result};

use crate::model::{AppConfig, PAYMENT_SERVICE, ServiceConfig};

/// Environment variable that pins the config directory.
pub const CONFIG_DIR_ENV: &str = "TRELLIS_CONFIG_DIR";

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
        }
    }

    pub fn default_config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }

        let local = PathBuf::from("configs");
        if local.exists() {
            return local;
        }

        match dirs::config_dir().map(|c| c.join("trellis")) {
            Some(xdg) if xdg.exists() => xdg,
            _ => local,
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load the config file (YAML preferred over TOML), then `.env`, then
    /// environment overrides.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = self.load_file()?;

        let env_path = self.config_dir.join(".env");
        if env_path.exists() {
            match dotenvy::from_path(&env_path) {
                Ok(()) => debug!("loaded environment from {}", env_path.display()),
                Err(e) => warn!("failed to read {}: {e}", env_path.display()),
            }
        }

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn load_file(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))
        } else {
            info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `HTTP_HOST`, `HTTP_PORT`, `PAYMENT_ADDR` and `LOG_LEVEL` on top of
/// the file config.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(host) = lookup("HTTP_HOST") {
        config.server.host = host;
    }

    if let Some(port) = lookup("HTTP_PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| Error::Config(format!("HTTP_PORT is not a valid port: {port}")))?;
    }

    if let Some(addr) = lookup("PAYMENT_ADDR") {
        config
            .services
            .entry(PAYMENT_SERVICE.to_string())
            .and_modify(|svc| svc.address = addr.clone())
            .or_insert_with(|| ServiceConfig::new(addr));
    }

    if let Some(level) = lookup("LOG_LEVEL") {
        config.log_level = Some(level);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ConfigLoader, apply_env_overrides};
    use crate::model::{AppConfig, PAYMENT_SERVICE};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = TempDir::new().unwrap();

        let config = ConfigLoader::with_dir(dir.path())
            .load_file()
            .expect("load should succeed");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert!(config.migrations.enabled);
        assert_eq!(
            config.services[PAYMENT_SERVICE].address,
            "http://localhost:9000"
        );
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "server:\n  host: \"0.0.0.0\"\n  port: 4001\n",
        )
        .expect("failed to write yaml config");
        fs::write(
            dir.path().join("config.toml"),
            "[server]\nhost = \"127.0.0.2\"\nport = 4999\n",
        )
        .expect("failed to write toml config");

        let config = ConfigLoader::with_dir(dir.path())
            .load_file()
            .expect("load should succeed");

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4001);
    }

    #[test]
    fn load_reads_toml_when_yaml_missing() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[server]\nport = 4002\n\n[migrations]\nlock_timeout_secs = 30\n\n[datasources]\ndata_dir = \"/var/lib/trellis\"\n",
        )
        .expect("failed to write toml config");

        let config = ConfigLoader::with_dir(dir.path())
            .load_file()
            .expect("load should succeed");

        assert_eq!(config.server.port, 4002);
        assert_eq!(config.migrations.lock_timeout_secs, Some(30));
        assert_eq!(
            config.datasources.sql_path(),
            std::path::PathBuf::from("/var/lib/trellis/app.db")
        );
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.yml"), "server: [unterminated").unwrap();

        let err = ConfigLoader::with_dir(dir.path())
            .load_file()
            .expect_err("should fail to parse");
        assert!(err.to_string().contains("failed to parse YAML config"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HTTP_PORT", "9100"),
            ("PAYMENT_ADDR", "http://payments.internal:9000"),
            ("LOG_LEVEL", "debug"),
        ]);

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()))
            .expect("overrides should apply");

        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.services[PAYMENT_SERVICE].address,
            "http://payments.internal:9000"
        );
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let mut config = AppConfig::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "HTTP_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }
}
