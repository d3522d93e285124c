//! Configuration for the provisioning runtime.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! | Variable               | Overrides          |
//! |------------------------|--------------------|
//! | `NETPROV_CONFIG`       | path of the file   |
//! | `NETPROV_TENANT_ID`    | `tenant_id`        |
//! | `NETPROV_DATABASE_URL` | `database_url`     |
//! | `NETPROV_METRICS_ADDR` | `metrics_addr`     |
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//!
//! ```
//! use netprov_runtime::config::ProvisioningConfig;
//!
//! let config = ProvisioningConfig::from_toml_str(r#"
//!     tenant_id = "isp-1"
//!
//!     [[pools]]
//!     id = "v4-residential"
//!     cidr = "100.64.0.0/24"
//! "#).unwrap();
//!
//! assert_eq!(config.pools.len(), 1);
//! assert_eq!(config.session.timeout().as_secs(), 5);
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use netprov_core::circuit::CircuitPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the config file path.
pub const ENV_CONFIG_PATH: &str = "NETPROV_CONFIG";
/// Environment override for `tenant_id`.
pub const ENV_TENANT_ID: &str = "NETPROV_TENANT_ID";
/// Environment override for `database_url`.
pub const ENV_DATABASE_URL: &str = "NETPROV_DATABASE_URL";
/// Environment override for `metrics_addr`.
pub const ENV_METRICS_ADDR: &str = "NETPROV_METRICS_ADDR";

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Workflow engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default retries per step
    pub max_retries: u32,
    /// Backoff before the first retry
    pub initial_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Default per-attempt step timeout
    pub step_timeout_secs: u64,
    /// Capacity of the failed-compensation queue
    pub dead_letter_capacity: usize,
}

impl EngineConfig {
    /// Retry policy for step handlers and compensations.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .build()
    }

    /// Default step timeout.
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.step_timeout_secs == 0 {
            return Err(invalid("engine.step_timeout_secs must be > 0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid("engine.max_backoff_ms must be >= engine.initial_backoff_ms"));
        }
        if self.dead_letter_capacity == 0 {
            return Err(invalid("engine.dead_letter_capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            step_timeout_secs: 10,
            dead_letter_capacity: 1_000,
        }
    }
}

/// Lifecycle service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Timeout for each reservation store call
    pub store_timeout_secs: u64,
    /// Timeout for each allocator call
    pub allocator_timeout_secs: u64,
}

impl LifecycleConfig {
    /// Store call timeout.
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Allocator call timeout.
    #[must_use]
    pub const fn allocator_timeout(&self) -> Duration {
        Duration::from_secs(self.allocator_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            store_timeout_secs: 10,
            allocator_timeout_secs: 10,
        }
    }
}

/// Session-control (AAA) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout for each CoA / disconnect
    pub timeout_secs: u64,
    /// Consecutive failures that open the breaker
    pub failure_threshold: usize,
    /// Seconds the breaker stays open before probing
    pub open_secs: u64,
    /// Successful probes needed to close the breaker
    pub success_threshold: usize,
}

impl SessionConfig {
    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Breaker configuration.
    #[must_use]
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .open_for(Duration::from_secs(self.open_secs))
            .success_threshold(self.success_threshold)
            .build()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            failure_threshold: 5,
            open_secs: 30,
            success_threshold: 1,
        }
    }
}

/// What the sweep does with an ALLOCATED row that was never activated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleAllocatedPolicy {
    /// Revoke it and return the address
    #[default]
    Revoke,
    /// Move it to FAILED for an operator
    Flag,
}

const MAX_STALE_AFTER_SECS: u64 = 10 * 365 * 24 * 3600;

/// Reconciliation sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Run the sweep at all
    pub enabled: bool,
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Age after which an ALLOCATED / REVOKING row counts as stuck
    pub stale_after_secs: u64,
    /// Days REVOKED rows are kept before purge
    pub retention_days: u32,
    /// Handling of stale ALLOCATED rows
    pub stale_allocated: StaleAllocatedPolicy,
    /// Capacity of the unresolved-row queue
    pub dead_letter_capacity: usize,
}

impl ReconciliationConfig {
    /// Sweep period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Staleness threshold.
    #[must_use]
    pub fn stale_after(&self) -> chrono::Duration {
        let secs = self.stale_after_secs.min(MAX_STALE_AFTER_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::from(u32::MAX)))
    }

    /// Retention window for REVOKED rows.
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(invalid("reconciliation.interval_secs must be > 0"));
        }
        if self.stale_after_secs == 0 {
            return Err(invalid("reconciliation.stale_after_secs must be > 0"));
        }
        if self.stale_after_secs > MAX_STALE_AFTER_SECS {
            return Err(invalid("reconciliation.stale_after_secs is unreasonably large"));
        }
        if self.dead_letter_capacity == 0 {
            return Err(invalid("reconciliation.dead_letter_capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            stale_after_secs: 900,
            retention_days: 30,
            stale_allocated: StaleAllocatedPolicy::Revoke,
            dead_letter_capacity: 1_000,
        }
    }
}

/// Access-location validation settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Policy applied by the `validate_circuit` step
    pub policy: CircuitPolicy,
}

/// One address pool served by the local allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool id referenced by `pool_id` / `ipv4_pool_id` / `ipv6_pool_id`
    pub id: String,
    /// Network in CIDR notation
    pub cidr: String,
    /// IPv6 only: size of the prefixes handed out (128 = single addresses)
    #[serde(default)]
    pub delegated_prefix_length: Option<u8>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Tenant every reservation is written under
    pub tenant_id: String,
    /// Postgres URL; in-memory store when absent
    pub database_url: Option<String>,
    /// Prometheus listener; no exporter when absent
    pub metrics_addr: Option<String>,
    /// Engine settings
    pub engine: EngineConfig,
    /// Lifecycle settings
    pub lifecycle: LifecycleConfig,
    /// Session-control settings
    pub session: SessionConfig,
    /// Sweep settings
    pub reconciliation: ReconciliationConfig,
    /// Location validation
    pub circuit: CircuitConfig,
    /// Local allocator pools
    pub pools: Vec<PoolConfig>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            database_url: None,
            metrics_addr: None,
            engine: EngineConfig::default(),
            lifecycle: LifecycleConfig::default(),
            session: SessionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            circuit: CircuitConfig::default(),
            pools: Vec::new(),
        }
    }
}

impl ProvisioningConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `NETPROV_CONFIG` (defaults when unset) and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns any load or validation error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) with an injectable variable lookup.
    ///
    /// # Errors
    ///
    /// Returns any load or validation error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(tenant) = lookup(ENV_TENANT_ID) {
            self.tenant_id = tenant;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(addr) = lookup(ENV_METRICS_ADDR) {
            self.metrics_addr = Some(addr).filter(|a| !a.is_empty());
        }
    }

    /// Parsed metrics listener address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the address does not parse.
    pub fn metrics_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.metrics_addr
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|e| invalid(format!("metrics_addr {raw:?}: {e}")))
            })
            .transpose()
    }

    /// Check ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tenant_id.trim().is_empty() {
            return Err(invalid("tenant_id cannot be empty"));
        }
        self.engine.validate()?;
        if self.lifecycle.store_timeout_secs == 0 || self.lifecycle.allocator_timeout_secs == 0 {
            return Err(invalid("lifecycle timeouts must be > 0"));
        }
        if self.session.timeout_secs == 0 {
            return Err(invalid("session.timeout_secs must be > 0"));
        }
        self.reconciliation.validate()?;
        self.metrics_socket_addr()?;

        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.id.trim().is_empty() {
                return Err(invalid("pool id cannot be empty"));
            }
            if !seen.insert(pool.id.as_str()) {
                return Err(invalid(format!("duplicate pool id {}", pool.id)));
            }
            crate::allocator::PoolRange::parse(pool).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}
