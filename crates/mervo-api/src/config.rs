//! Configuration management for the mervo webhook service.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use mervo_core::{ConnectorManifest, ConnectorRegistry, SIGNATURE_HEADER};
use mervo_delivery::{BackoffPolicy, ClientConfig, DeliveryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::dedupe::DedupeConfig;

const CONFIG_FILE: &str = "config.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Without `DATABASE_URL` the service runs on the in-memory queue, so it
/// starts with no external dependencies.
///
/// # Example
///
/// ```no_run
/// use mervo_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL. Selects the PostgreSQL queue when set.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default, alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds. Must exceed
    /// `delivery_timeout_seconds` so a manual dispatch can answer in time.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Inbound
    /// Shared secret for the inbound receive endpoint. When absent every
    /// receive is rejected.
    ///
    /// Environment variable: `WEBHOOK_SECRET`
    #[serde(default, alias = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
    /// Header carrying the inbound signature.
    ///
    /// Environment variable: `SIGNATURE_HEADER`
    #[serde(default = "default_signature_header", alias = "SIGNATURE_HEADER")]
    pub signature_header: String,
    /// How long an inbound event id is remembered, in seconds.
    ///
    /// Environment variable: `DEDUPE_TTL_SECONDS`
    #[serde(default = "default_dedupe_ttl", alias = "DEDUPE_TTL_SECONDS")]
    pub dedupe_ttl_seconds: u64,
    /// Maximum number of remembered inbound event ids.
    ///
    /// Environment variable: `DEDUPE_MAX_ENTRIES`
    #[serde(default = "default_dedupe_max_entries", alias = "DEDUPE_MAX_ENTRIES")]
    pub dedupe_max_entries: u64,

    // Retry
    /// Failed attempts before a delivery is dead-lettered.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Backoff base in milliseconds.
    ///
    /// Environment variable: `BACKOFF_BASE_MS`
    #[serde(default = "default_backoff_base_ms", alias = "BACKOFF_BASE_MS")]
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    ///
    /// Environment variable: `BACKOFF_CAP_MS`
    #[serde(default = "default_backoff_cap_ms", alias = "BACKOFF_CAP_MS")]
    pub backoff_cap_ms: u64,

    // Delivery
    /// Per-call timeout for outbound deliveries in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_COUNT`
    #[serde(default = "default_worker_count", alias = "WORKER_COUNT")]
    pub worker_count: usize,
    /// Idle poll interval for workers in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    // Connectors
    /// Connector manifests registered at startup, declared as
    /// `[[connectors]]` tables in `config.toml`.
    #[serde(default)]
    pub connectors: Vec<ConnectorManifest>,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when a source cannot be parsed or the resulting
    /// values fail validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        Self::from_figment(&figment)
    }

    /// Extract and validate configuration from an assembled figment.
    ///
    /// # Errors
    ///
    /// Returns an error when extraction or validation fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Build the connector registry from the configured manifests.
    ///
    /// # Errors
    ///
    /// Returns an error when a manifest is invalid or two manifests share an
    /// id or key.
    pub async fn connector_registry(&self) -> Result<ConnectorRegistry> {
        ConnectorRegistry::from_manifests(self.connectors.iter().cloned())
            .await
            .context("Invalid connector manifest")
    }

    /// Convert to the delivery engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the retry settings are inconsistent.
    pub fn to_delivery_config(&self) -> Result<DeliveryConfig> {
        Ok(DeliveryConfig {
            worker_count: self.worker_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy()?,
            ..DeliveryConfig::default()
        })
    }

    /// Convert to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Convert to retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero attempt budget or a cap below the base.
    pub fn to_retry_policy(&self) -> Result<RetryPolicy> {
        let backoff = BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )?;
        Ok(RetryPolicy::new(self.max_attempts, backoff)?)
    }

    /// Convert to inbound dedupe configuration.
    pub fn to_dedupe_config(&self) -> DedupeConfig {
        DedupeConfig {
            ttl: Duration::from_secs(self.dedupe_ttl_seconds),
            max_entries: self.dedupe_max_entries,
        }
    }

    /// Parse server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> Option<String> {
        let url = self.database_url.as_ref()?;
        if let Some(at_pos) = url.find('@') {
            if let Some(colon_pos) = url[..at_pos].rfind(':') {
                let mut masked = url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return Some(masked);
            }
        }
        Some(url.clone())
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.backoff_base_ms == 0 {
            anyhow::bail!("backoff_base_ms must be greater than 0");
        }

        if self.backoff_cap_ms < self.backoff_base_ms {
            anyhow::bail!("backoff_cap_ms cannot be below backoff_base_ms");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.request_timeout <= self.delivery_timeout_seconds {
            anyhow::bail!(
                "request_timeout ({}s) must exceed delivery_timeout_seconds ({}s)",
                self.request_timeout,
                self.delivery_timeout_seconds
            );
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.dedupe_max_entries == 0 {
            anyhow::bail!("dedupe_max_entries must be greater than 0");
        }

        if self.signature_header.trim().is_empty() {
            anyhow::bail!("signature_header must not be empty");
        }

        for manifest in &self.connectors {
            manifest.validate().context("Invalid connector manifest")?;
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url_masked())
            .field("database_max_connections", &self.database_max_connections)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("request_timeout", &self.request_timeout)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("signature_header", &self.signature_header)
            .field("dedupe_ttl_seconds", &self.dedupe_ttl_seconds)
            .field("dedupe_max_entries", &self.dedupe_max_entries)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_cap_ms", &self.backoff_cap_ms)
            .field("delivery_timeout_seconds", &self.delivery_timeout_seconds)
            .field("worker_count", &self.worker_count)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("connectors", &self.connectors.len())
            .field("rust_log", &self.rust_log)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_max_connections(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            webhook_secret: None,
            signature_header: default_signature_header(),
            dedupe_ttl_seconds: default_dedupe_ttl(),
            dedupe_max_entries: default_dedupe_max_entries(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            connectors: Vec::new(),
            rust_log: default_log_level(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_signature_header() -> String {
    SIGNATURE_HEADER.to_string()
}

fn default_dedupe_ttl() -> u64 {
    86_400
}

fn default_dedupe_max_entries() -> u64 {
    100_000
}

fn default_max_attempts() -> u32 {
    mervo_delivery::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60000
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_worker_count() -> usize {
    mervo_delivery::DEFAULT_WORKER_COUNT
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}
