//! Configuration loader with file discovery and environment overrides.

use crate::{ConfigError, Profile, RelayConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &["relay.toml", "./config/relay.toml", "/etc/relay/relay.toml"];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load from file (if found) and apply `RELAY_*` env overrides.
    pub fn load(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            config = RelayConfig::from_toml(&raw)?;
        }

        self.apply_env_overrides(&mut config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn apply_env_overrides(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("RELAY_PROFILE") {
            let profile = Profile::parse(&val)?;
            *config = RelayConfig::for_profile(profile);
        }

        if let Ok(val) = env::var("RELAY_ADMISSION_RATE_PER_SECOND") {
            if let Ok(rate) = val.parse() {
                config.admission.rate_per_second = rate;
                config.admission.enable_rate_limit = true;
            }
        }
        if let Ok(val) = env::var("RELAY_ADMISSION_MAX_CONCURRENT") {
            if let Ok(max) = val.parse() {
                config.admission.max_concurrent = max;
                config.admission.enable_concurrency_limit = true;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_POLLING_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.outbox.polling_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.batch_size = size;
            }
        }
        if let Ok(val) = env::var("RELAY_INBOX_LOCK_TTL_SECONDS") {
            if let Ok(ttl) = val.parse() {
                config.inbox.lock_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("RELAY_IDEMPOTENCY_RETENTION_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.idempotency.retention_window_seconds = secs;
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_without_file_yields_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/relay.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.outbox.batch_size, 100);
    }

    #[test]
    fn load_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[outbox]\nbatch_size = 42").unwrap();

        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.outbox.batch_size, 42);
    }
}
