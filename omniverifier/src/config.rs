//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set via the
//! `-f` flag or `OMNIVERIFIER_CONFIG`. Variables prefixed with
//! `OMNIVERIFIER_` override YAML values; nested fields use double
//! underscores (`OMNIVERIFIER_ENGINE__POLL_INTERVAL=10s`). `DATABASE_URL`
//! overrides `database.url` when set.

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "OMNIVERIFIER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Database connection settings
    pub database: DatabaseConfig,
    /// External verification provider settings
    pub provider: ProviderConfig,
    /// Object storage backend for source files and exports
    pub object_store: ObjectStoreConfig,
    /// Engine tunables (packer caps, rate limits, poll cadence)
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            provider: ProviderConfig::default(),
            object_store: ObjectStoreConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment overrides.
    pub fn load(args: &Args) -> Result<Self, Error> {
        let mut figment = Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("OMNIVERIFIER_").split("__"));

        if let Ok(url) = std::env::var("DATABASE_URL") {
            figment = figment.merge(("database.url", url));
        }

        let config: Config = figment
            .extract()
            .map_err(|e| Error::BadRequest(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.engine.max_emails_per_provider_batch == 0 {
            return Err(Error::BadRequest(
                "engine.max_emails_per_provider_batch must be positive".into(),
            ));
        }
        if self.engine.rate_limit_buffer >= self.engine.rate_limit_per_minute {
            return Err(Error::BadRequest(
                "engine.rate_limit_buffer must be smaller than engine.rate_limit_per_minute".into(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL (`postgres://…`)
    pub url: String,
    /// Connection pool sizing
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/omniverifier".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

/// Individual pool configuration with the SQLx parameters that matter here.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds)
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

/// Settings for the external verification API client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    pub endpoint: String,
    /// Bearer token; empty disables the Authorization header
    pub api_key: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.verification.example".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Which object storage backend to construct at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// Local filesystem, for development and tests
    Local {
        /// Directory all keys resolve under
        root: String,
    },
    /// S3 (or an S3-compatible endpoint)
    S3 {
        bucket: String,
        /// Optional custom endpoint for S3-compatible stores
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        ObjectStoreConfig::Local {
            root: "./data/objects".to_string(),
        }
    }
}

/// Engine tunables. Defaults match the deployment constants the batching
/// algorithms are specified against.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent in-flight provider batches per check-type
    pub max_concurrent_provider_batches: usize,
    /// Largest provider batch the packer may assemble
    pub max_emails_per_provider_batch: usize,
    /// Provider API budget per sliding minute
    pub rate_limit_per_minute: i64,
    /// Headroom subtracted from the per-minute budget
    pub rate_limit_buffer: i64,
    /// Open provider batches older than this are declared failed
    #[serde(with = "humantime_serde")]
    pub provider_batch_timeout: Duration,
    /// Cadence of the packer, lifecycle poller and sweeper loops
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Enrichment progress checkpoint interval, in source rows
    pub enrichment_progress_interval_rows: u64,
    /// Spend subscription credits before one-off credits
    pub subscription_consumes_before_oneoff: bool,
    /// Status-poll failures tolerated before a provider batch is failed
    pub max_poll_retries: i32,
    /// Base backoff after a failed status poll (doubled per attempt)
    #[serde(with = "humantime_serde")]
    pub poll_backoff: Duration,
    /// Ceiling for the poll backoff
    #[serde(with = "humantime_serde")]
    pub max_poll_backoff: Duration,
    /// TTL for presigned source upload URLs
    #[serde(with = "humantime_serde")]
    pub upload_url_ttl: Duration,
    /// TTL for presigned export download URLs
    #[serde(with = "humantime_serde")]
    pub export_url_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_provider_batches: 10,
            max_emails_per_provider_batch: 10_000,
            rate_limit_per_minute: 200,
            rate_limit_buffer: 20,
            provider_batch_timeout: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(5),
            enrichment_progress_interval_rows: 10_000,
            subscription_consumes_before_oneoff: true,
            max_poll_retries: 3,
            poll_backoff: Duration::from_secs(30),
            max_poll_backoff: Duration::from_secs(600),
            upload_url_ttl: Duration::from_secs(60 * 60),
            export_url_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_provider_batches, 10);
        assert_eq!(config.max_emails_per_provider_batch, 10_000);
        assert_eq!(config.rate_limit_per_minute, 200);
        assert_eq!(config.rate_limit_buffer, 20);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(
            config.provider_batch_timeout,
            Duration::from_secs(24 * 60 * 60)
        );
        assert!(config.subscription_consumes_before_oneoff);
    }

    #[test]
    fn buffer_must_leave_budget() {
        let config = Config {
            engine: EngineConfig {
                rate_limit_per_minute: 10,
                rate_limit_buffer: 10,
                ..EngineConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
