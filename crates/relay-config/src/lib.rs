//! Relay configuration.
//!
//! Every tunable surface of the core lives here as a serde-friendly
//! section; durations are numeric fields (`*_ms`, `*_seconds`) with helper
//! accessors returning `std::time::Duration`. Named profiles give sensible
//! presets: admission control is off in `development` and on in
//! `production`.

pub mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    Io(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("unknown profile: {0}")]
    UnknownProfile(String),
}

/// Admission gate applied before the pipeline on `send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enable_rate_limit: bool,
    /// Sustained admission rate in operations per second.
    pub rate_per_second: u32,
    /// Extra immediate capacity above the sustained rate.
    pub burst: u32,
    pub enable_circuit_breaker: bool,
    /// Consecutive transient failures before the breaker opens.
    pub failure_threshold: u32,
    /// Cool-down before a half-open probe is admitted.
    pub reset_timeout_seconds: u64,
    pub enable_concurrency_limit: bool,
    pub max_concurrent: u32,
    /// Callers allowed to wait for a permit before `Overloaded`; zero
    /// means deny immediately on saturation.
    pub queue_depth: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enable_rate_limit: false,
            rate_per_second: 1_000,
            burst: 100,
            enable_circuit_breaker: false,
            failure_threshold: 5,
            reset_timeout_seconds: 30,
            enable_concurrency_limit: false,
            max_concurrent: 256,
            queue_depth: 0,
        }
    }
}

impl AdmissionConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }
}

/// Retry behavior inside the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retry.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
            backoff_factor: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Background outbox publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub polling_interval_ms: u64,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long a claimed record stays invisible to other workers.
    pub claim_lease_seconds: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1_000,
            batch_size: 100,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            claim_lease_seconds: 30,
        }
    }
}

impl OutboxConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_seconds)
    }
}

/// What the inbox consumer does when a peer already holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMissDisposition {
    /// Acknowledge without processing; the lock holder owns the message.
    Ack,
    /// Negative-acknowledge so the broker redelivers later.
    Nack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub lock_ttl_seconds: u64,
    pub max_redeliveries: u32,
    pub lock_miss_disposition: LockMissDisposition,
    /// Redelivery delay hint passed on nack.
    pub nack_delay_seconds: u32,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            lock_ttl_seconds: 300,
            max_redeliveries: 5,
            lock_miss_disposition: LockMissDisposition::Ack,
            nack_delay_seconds: 5,
        }
    }
}

impl InboxConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Keys older than this window may be purged. Should cover the broker's
    /// retention plus a safety margin.
    pub retention_window_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_window_seconds: 24 * 60 * 60,
        }
    }
}

impl IdempotencyConfig {
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Gzip,
    Brotli,
    Lz4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    /// Payloads below this size are sent uncompressed.
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: CompressionAlgorithm::Gzip,
            threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub batch_size: u32,
    pub batch_timeout_ms: u64,
    pub compression: CompressionConfig,
    /// Bounded per-subscription queue capacity.
    pub subscribe_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout_ms: 100,
            compression: CompressionConfig::default(),
            subscribe_queue_capacity: 1_024,
        }
    }
}

impl TransportConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Named presets over the whole configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    Development,
    Production,
    Conservative,
    HighPerformance,
}

impl Profile {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "development" => Ok(Profile::Development),
            "production" => Ok(Profile::Production),
            "conservative" => Ok(Profile::Conservative),
            "high-performance" => Ok(Profile::HighPerformance),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub profile: Option<Profile>,
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub outbox: OutboxConfig,
    pub inbox: InboxConfig,
    pub idempotency: IdempotencyConfig,
    pub transport: TransportConfig,
}

impl RelayConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: RelayConfig =
            toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(profile) = config.profile {
            config = config.overlay_profile(profile);
        }
        Ok(config)
    }

    /// Preset for a named profile with all other fields at their defaults.
    pub fn for_profile(profile: Profile) -> Self {
        RelayConfig::default().overlay_profile(profile)
    }

    fn overlay_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        match profile {
            Profile::Development => {
                self.admission.enable_rate_limit = false;
                self.admission.enable_circuit_breaker = false;
                self.admission.enable_concurrency_limit = false;
            }
            Profile::Production => {
                self.admission.enable_rate_limit = true;
                self.admission.enable_circuit_breaker = true;
                self.admission.enable_concurrency_limit = true;
            }
            Profile::Conservative => {
                self.admission.enable_rate_limit = true;
                self.admission.rate_per_second = 200;
                self.admission.burst = 20;
                self.admission.enable_circuit_breaker = true;
                self.admission.failure_threshold = 3;
                self.admission.enable_concurrency_limit = true;
                self.admission.max_concurrent = 64;
                self.retry.max_attempts = 5;
                self.outbox.batch_size = 25;
                self.transport.batch_size = 10;
            }
            Profile::HighPerformance => {
                self.admission.enable_rate_limit = false;
                self.admission.enable_circuit_breaker = true;
                self.admission.failure_threshold = 20;
                self.admission.enable_concurrency_limit = true;
                self.admission.max_concurrent = 2_048;
                self.outbox.polling_interval_ms = 100;
                self.outbox.batch_size = 500;
                self.transport.batch_size = 200;
                self.transport.compression.enabled = true;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_admission_disabled() {
        let config = RelayConfig::default();
        assert!(!config.admission.enable_rate_limit);
        assert!(!config.admission.enable_circuit_breaker);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn production_profile_enables_admission() {
        let config = RelayConfig::for_profile(Profile::Production);
        assert!(config.admission.enable_rate_limit);
        assert!(config.admission.enable_circuit_breaker);
        assert!(config.admission.enable_concurrency_limit);
    }

    #[test]
    fn profile_in_toml_is_applied() {
        let config = RelayConfig::from_toml(
            r#"
            profile = "conservative"

            [outbox]
            max_attempts = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.profile, Some(Profile::Conservative));
        assert_eq!(config.admission.rate_per_second, 200);
        // Profile overlay does not touch fields it does not name.
        assert_eq!(config.outbox.max_attempts, 7);
    }

    #[test]
    fn unknown_profile_fails_fast() {
        assert!(matches!(
            Profile::parse("turbo"),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            RelayConfig::from_toml("profile = turbo"),
            Err(ConfigError::Parse(_))
        ));
    }
}
