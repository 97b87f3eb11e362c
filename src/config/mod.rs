use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Max pooled connections (push watchers hold one each while listening)
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Redis connection string for the dispatch queue
    pub redis_url: String,

    /// Gemini API key
    pub gemini_api_key: String,

    /// Gemini REST base URL
    #[serde(default = "default_gemini_api_base")]
    pub gemini_api_base: String,

    /// Model used when neither the job nor the user picks one
    #[serde(default = "default_ai_model")]
    pub default_ai_model: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Public base URL results are served from
    pub r2_public_base_url: String,

    #[serde(default = "default_asset_fetch_timeout_secs")]
    pub asset_fetch_timeout_secs: u64,

    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    /// Lifetime of presigned input asset URLs
    #[serde(default = "default_asset_url_ttl_secs")]
    pub asset_url_ttl_secs: u32,

    /// Age after which a non-terminal job is reported as stuck
    #[serde(default = "default_stale_job_threshold_secs")]
    pub stale_job_threshold_secs: u64,

    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// Upper bound for the long-poll endpoint
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_gemini_api_base() -> String {
    crate::services::providers::gemini::DEFAULT_API_BASE.to_string()
}

fn default_ai_model() -> String {
    "gemini-2.5-flash-image-preview".to_string()
}

fn default_asset_fetch_timeout_secs() -> u64 {
    30
}

fn default_generation_timeout_secs() -> u64 {
    180
}

fn default_asset_url_ttl_secs() -> u32 {
    3600
}

fn default_stale_job_threshold_secs() -> u64 {
    900
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_watch_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn asset_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_fetch_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn stale_job_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_job_threshold_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}
