use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::keys::DEFAULT_PREFIX;
use crate::{Error, Result};

/// Orchestrator instance configuration.
///
/// Every field has a default so a partial `corvid.toml` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity written as the processing-lock value.
    pub node_name: String,
    pub workers_number: usize,
    /// Root of every key written to the coordination store.
    pub kv_prefix: String,
    #[serde(rename = "long_poll_wait_ms", with = "millis")]
    pub long_poll_wait: Duration,
    #[serde(rename = "lock_wait_time_ms", with = "millis")]
    pub lock_wait_time: Duration,
    #[serde(rename = "handoff_timeout_ms", with = "millis")]
    pub handoff_timeout: Duration,
    #[serde(rename = "handoff_backoff_ms", with = "millis")]
    pub handoff_backoff: Duration,
    #[serde(rename = "create_lock_poll_interval_ms", with = "millis")]
    pub create_lock_poll_interval: Duration,
    pub create_lock_max_retries: u32,
    /// Extra attempts for provisioner errors flagged retriable.
    pub operation_retries: u32,
    #[serde(rename = "operation_retry_delay_ms", with = "millis")]
    pub operation_retry_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            workers_number: 3,
            kv_prefix: DEFAULT_PREFIX.to_string(),
            long_poll_wait: Duration::from_secs(5),
            lock_wait_time: Duration::from_millis(10),
            handoff_timeout: Duration::from_secs(5),
            handoff_backoff: Duration::from_millis(100),
            create_lock_poll_interval: Duration::from_millis(100),
            create_lock_max_retries: 50,
            operation_retries: 0,
            operation_retry_delay: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn corvid_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".corvid"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::corvid_dir()?.join("corvid.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            node = %config.node_name,
            workers = config.workers_number,
            prefix = %config.kv_prefix,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::corvid_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating corvid directory");
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers_number == 0 {
            return Err(Error::Validation("workers_number must be at least 1".into()));
        }
        if self.node_name.trim().is_empty() {
            return Err(Error::Validation("node_name must not be empty".into()));
        }
        if self.kv_prefix.trim_matches('/').is_empty() {
            return Err(Error::Validation("kv_prefix must not be empty".into()));
        }
        Ok(())
    }
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("corvid-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
