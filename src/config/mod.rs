//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparseable. The database URL is wrapped in `SecretString` to keep it
//! out of logs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::WorkerConfig;
use crate::error::{Error, Result};
use crate::model::WorkerId;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub worker_id: WorkerId,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Root directory for per-pair git workspaces.
    pub workspace_root: PathBuf,
    /// Root directory deployments are published into.
    pub publish_root: PathBuf,
    /// Public URL prefix corresponding to `publish_root`.
    pub public_base_url: String,
    /// TOML file naming the edit and build hooks.
    pub pipeline_config: PathBuf,
    /// Optional URL responses are POSTed to in addition to the output queue.
    pub response_webhook: Option<String>,
    pub lease: Duration,
    pub idle_timeout: Duration,
    pub release_timeout: Duration,
    pub step_timeout: Duration,
    pub max_pairs: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            worker_id: std::env::var("WORKER_ID")
                .map(WorkerId::new)
                .unwrap_or_else(|_| {
                    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
                    WorkerId::generate(&host)
                }),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workspace_root: path_var("WORKSPACE_ROOT", "/var/lib/mailroom/workspaces"),
            publish_root: path_var("PUBLISH_ROOT", "/var/lib/mailroom/public"),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            pipeline_config: path_var("PIPELINE_CONFIG", "pipeline.toml"),
            response_webhook: std::env::var("RESPONSE_WEBHOOK").ok(),
            lease: Duration::from_secs(parsed_var("LEASE_SECS", 60)?),
            idle_timeout: Duration::from_secs(parsed_var("IDLE_SECS", 300)?),
            release_timeout: Duration::from_secs(parsed_var("RELEASE_SECS", 1800)?),
            step_timeout: Duration::from_secs(parsed_var("STEP_TIMEOUT_SECS", 600)?),
            max_pairs: parsed_var("MAX_PAIRS", 4)?,
        })
    }

    /// Worker runtime knobs derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone(),
            lease: self.lease,
            idle_timeout: self.idle_timeout,
            release_timeout: self.release_timeout,
            step_timeout: self.step_timeout,
            max_pairs: self.max_pairs,
            ..WorkerConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn path_var(name: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
