use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the upstream service used by `GET /customer`.
pub const PAYMENT_SERVICE: &str = "payment";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub datasources: DatasourceConfig,

    #[serde(default = "default_services")]
    pub services: HashMap<String, ServiceConfig>,

    #[serde(default)]
    pub migrations: MigrationConfig,

    #[serde(default)]
    pub cron: CronConfig,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            datasources: DatasourceConfig::default(),
            services: default_services(),
            migrations: MigrationConfig::default(),
            cron: CronConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory served under `/static`.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

/// Where each backing store lives. Relative file names resolve against `data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_sql_file")]
    pub sql_file: String,

    #[serde(default = "default_document_file")]
    pub document_file: String,

    #[serde(default = "default_kv_file")]
    pub kv_file: String,

    /// Root directory of the object store browsed by `GET /s3`.
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,
}

impl DatasourceConfig {
    pub fn sql_path(&self) -> PathBuf {
        self.data_dir.join(&self.sql_file)
    }

    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join(&self.document_file)
    }

    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join(&self.kv_file)
    }
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sql_file: default_sql_file(),
            document_file: default_document_file(),
            kv_file: default_kv_file(),
            file_root: default_file_root(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_sql_file() -> String {
    "app.db".to_string()
}

fn default_document_file() -> String {
    "documents.db".to_string()
}

fn default_kv_file() -> String {
    "kv.db".to_string()
}

fn default_file_root() -> PathBuf {
    PathBuf::from("data/files")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub address: String,

    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

impl ServiceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout_secs: default_service_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_service_timeout() -> u64 {
    10
}

fn default_services() -> HashMap<String, ServiceConfig> {
    HashMap::from([(
        PAYMENT_SERVICE.to_string(),
        ServiceConfig::new("http://localhost:9000"),
    )])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Run pending migrations before the server starts.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long to wait for another process holding the migration lock.
    /// `None` waits indefinitely.
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,

    /// Lifetime of a lock claim. The holder renews it before each migration;
    /// a claim left past its expiry by a dead process is taken over.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

impl MigrationConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_timeout_secs: None,
            lock_poll_ms: default_lock_poll_ms(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

fn default_lock_poll_ms() -> u64 {
    250
}

fn default_lock_lease_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}
