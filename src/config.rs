//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Bearer token required on the management API
    pub api_token: String,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Source platform configuration (the activity feed we poll)
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the source platform's activity API
    pub base_url: String,
    /// Base URL of the source platform's web frontend,
    /// used to build notification target links
    pub web_base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Sink platform configuration (the push gateway we deliver to)
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Shared secret for verifying inbound webhook signatures
    pub webhook_secret: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Allow callback endpoints on loopback or private hosts.
    /// Meant for local development; leave off in production.
    pub allow_private_endpoints: bool,
}

impl SinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Relay cycle tuning
///
/// Every constant the delivery pipeline depends on lives here rather
/// than being hard-coded, so deployments can tighten or relax the
/// relay without a rebuild.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds between periodic delivery cycles (default: 300)
    pub cycle_interval_seconds: u64,
    /// Cold-start lookback window in hours for handles with no
    /// read cursor (default: 24)
    pub lookback_hours: i64,
    /// Maximum events delivered for a cold-start fetch (default: 50)
    pub cold_start_max_events: usize,
    /// Seconds a failed delivery waits before becoming retryable
    /// (default: 86400 = 24h)
    pub failure_backoff_seconds: i64,
    /// Delivery attempts before a failure becomes permanent (default: 3)
    pub max_attempts: i64,
    /// Seconds after which a pending claim is considered stuck and
    /// reclaimable (default: 600)
    pub pending_timeout_seconds: i64,
    /// Days sent/exhausted ledger rows are retained before purge
    /// (default: 30)
    pub retention_days: i64,
    /// Bounded worker pool size for concurrent account processing
    /// (default: 8)
    pub max_concurrent_accounts: usize,
    /// Seconds an in-process account lease is held; overlapping cycles
    /// skip a leased account (default: 60)
    pub lease_seconds: u64,
    /// Seconds between ledger purge runs (default: 86400 = 24h)
    pub purge_interval_seconds: u64,
}

impl RelayConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_seconds)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours)
    }

    pub fn failure_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_backoff_seconds)
    }

    pub fn pending_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_timeout_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEEDBRIDGE_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("source.timeout_seconds", 30)?
            .set_default("sink.timeout_seconds", 30)?
            .set_default("sink.allow_private_endpoints", false)?
            .set_default("relay.cycle_interval_seconds", 300)?
            .set_default("relay.lookback_hours", 24)?
            .set_default("relay.cold_start_max_events", 50)?
            .set_default("relay.failure_backoff_seconds", 86400)?
            .set_default("relay.max_attempts", 3)?
            .set_default("relay.pending_timeout_seconds", 600)?
            .set_default("relay.retention_days", 30)?
            .set_default("relay.max_concurrent_accounts", 8)?
            .set_default("relay.lease_seconds", 60)?
            .set_default("relay.purge_interval_seconds", 86400)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEEDBRIDGE_*)
            .add_source(
                Environment::with_prefix("FEEDBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_API_TOKEN_BYTES: usize = 16;
        const MIN_WEBHOOK_SECRET_BYTES: usize = 32;

        if self.server.api_token.as_bytes().len() < MIN_API_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "server.api_token must be at least {} bytes",
                MIN_API_TOKEN_BYTES
            )));
        }

        if self.sink.webhook_secret.as_bytes().len() < MIN_WEBHOOK_SECRET_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "sink.webhook_secret must be at least {} bytes",
                MIN_WEBHOOK_SECRET_BYTES
            )));
        }

        for (name, url) in [
            ("source.base_url", &self.source.base_url),
            ("source.web_base_url", &self.source.web_base_url),
        ] {
            let parsed = url::Url::parse(url)
                .map_err(|e| crate::error::AppError::Config(format!("{}: {}", name, e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(crate::error::AppError::Config(format!(
                    "{} must be an http(s) URL",
                    name
                )));
            }
        }

        if self.relay.cycle_interval_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "relay.cycle_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.relay.max_concurrent_accounts == 0 {
            return Err(crate::error::AppError::Config(
                "relay.max_concurrent_accounts must be greater than 0".to_string(),
            ));
        }

        if self.relay.max_attempts <= 0 {
            return Err(crate::error::AppError::Config(
                "relay.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.relay.pending_timeout_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "relay.pending_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
