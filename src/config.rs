use crate::store::WriteConcern;
use crate::transaction::RetryPolicy;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Batch execution settings
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Collection audit entries are written to
    pub audit_collection: String,

    /// Write audit entries at all
    pub audit_enabled: bool,

    /// Commit acknowledgment requirement
    pub write_concern: WriteConcern,

    pub retry: RetryPolicy,

    /// Upper bound on one batch, retries included
    pub request_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            audit_collection: "audit_log".to_string(),
            audit_enabled: true,
            write_concern: WriteConcern::Majority,
            retry: RetryPolicy::default(),
            request_timeout: None,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_collection(mut self, collection: &str) -> Self {
        self.audit_collection = collection.to_string();
        self
    }

    pub fn audit_enabled(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process configuration, read once at startup from flags or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "txbatch", version, about = "Atomic audited batch mutation service")]
pub struct ServiceConfig {
    #[arg(
        long,
        env = "MONGO_URL",
        default_value = "mongodb://localhost:27017/medical_events?replicaSet=replicaTest"
    )]
    pub mongo_url: String,

    #[arg(long, env = "DB_NAME", default_value = "medical_data")]
    pub db_name: String,

    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 50)]
    pub db_pool_size: u32,

    /// Nodes that must acknowledge a commit. 0 means majority.
    #[arg(long, env = "DB_WRITE_CONCERN", default_value_t = 0)]
    pub db_write_concern: u32,

    #[arg(long, env = "AUDIT_LOG_COLLECTION", default_value = "audit_log")]
    pub audit_log_collection: String,

    #[arg(
        long,
        env = "AUDIT_LOG_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub audit_log_enabled: bool,

    #[arg(long, env = "HEALTH_CHECK_PATH", default_value = "/tmp/healthy")]
    pub health_check_path: PathBuf,

    #[arg(long, env = "SERVICE_NAME", default_value = "mongo_transaction")]
    pub service_name: String,

    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:7400")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Attempts per batch. 0 retries for as long as errors stay retryable.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 0)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "RETRY_BASE_BACKOFF_MS", default_value_t = 10)]
    pub retry_base_backoff_ms: u64,

    #[arg(long, env = "RETRY_MAX_BACKOFF_MS", default_value_t = 1000)]
    pub retry_max_backoff_ms: u64,

    /// 0 disables the per-request timeout.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 0)]
    pub request_timeout_ms: u64,

    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Mongo)]
    pub store_backend: StoreBackend,
}

impl ServiceConfig {
    pub fn batch_config(&self) -> BatchConfig {
        let retry = RetryPolicy::bounded(self.retry_max_attempts).backoff(
            Duration::from_millis(self.retry_base_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        );
        let timeout = (self.request_timeout_ms > 0)
            .then(|| Duration::from_millis(self.request_timeout_ms));

        BatchConfig::new()
            .audit_collection(&self.audit_log_collection)
            .audit_enabled(self.audit_log_enabled)
            .write_concern(WriteConcern::from_override(self.db_write_concern))
            .retry(retry)
            .request_timeout(timeout)
    }
}
