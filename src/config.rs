//! Configuration
//!
//! Everything is loaded once at startup from a TOML file; missing keys fall
//! back to defaults. Filter and decoder settings are immutable once the
//! objects using them are constructed.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub decoder: DecoderConfig,
    pub filter: FilterConfig,
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Platform config file location, e.g. `~/.config/snapsync-client/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "snapsync", "snapsync-client")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config file, or use defaults if there is none
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".into()));
        }
        if self.client.time_sync_interval_ms == 0 {
            return Err(Error::Config("client.time_sync_interval_ms must be non-zero".into()));
        }
        if self.decoder.max_frame_size == 0 {
            return Err(Error::Config("decoder.max_frame_size must be non-zero".into()));
        }
        if self.playback.queue_capacity == 0 {
            return Err(Error::Config("playback.queue_capacity must be non-zero".into()));
        }
        self.filter.validate().map_err(Error::Config)
    }
}

/// Where to find the stream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

/// How this client introduces itself and keeps in sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    /// Stable client id reported in the hello message
    pub id: String,
    pub instance: u32,
    /// Period between time requests
    pub time_sync_interval_ms: u64,
    /// Accepted time samples required before chunks are scheduled
    pub warm_up_samples: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "snapsync-client".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            instance: 1,
            time_sync_interval_ms: DEFAULT_TIME_SYNC_INTERVAL_MS,
            warm_up_samples: DEFAULT_WARM_UP_SAMPLES,
        }
    }
}

/// Wire decoder limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Frames announcing a larger payload are rejected and skipped
    pub max_frame_size: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Clock filter tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Offset random-walk variance per time unit
    pub process_variance: f64,
    /// Drift random-walk variance per time unit
    pub drift_process_variance: f64,
    /// Covariance inflation on a large residual; applied squared
    pub forget_factor: f64,
    /// Residual threshold as a multiple of the sample's max error
    pub adaptive_cutoff: f64,
    /// Samples to accept before adaptive forgetting may kick in
    pub min_samples_for_forgetting: u8,
}

impl FilterConfig {
    /// Build from standard deviations, the way filters are usually tuned
    pub fn from_std_devs(
        process_std_dev: f64,
        drift_process_std_dev: f64,
        forget_factor: f64,
        adaptive_cutoff: f64,
        min_samples_for_forgetting: u8,
    ) -> Self {
        Self {
            process_variance: process_std_dev * process_std_dev,
            drift_process_variance: drift_process_std_dev * drift_process_std_dev,
            forget_factor,
            adaptive_cutoff,
            min_samples_for_forgetting,
        }
    }

    pub fn forget_variance_factor(&self) -> f64 {
        self.forget_factor * self.forget_factor
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.process_variance >= 0.0 && self.process_variance.is_finite()) {
            return Err(format!("filter.process_variance invalid: {}", self.process_variance));
        }
        if !(self.drift_process_variance >= 0.0 && self.drift_process_variance.is_finite()) {
            return Err(format!(
                "filter.drift_process_variance invalid: {}",
                self.drift_process_variance
            ));
        }
        if !(self.forget_factor >= 1.0 && self.forget_factor.is_finite()) {
            return Err(format!("filter.forget_factor must be >= 1: {}", self.forget_factor));
        }
        if !(self.adaptive_cutoff > 0.0) {
            return Err(format!("filter.adaptive_cutoff must be > 0: {}", self.adaptive_cutoff));
        }
        Ok(())
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::from_std_devs(
            DEFAULT_PROCESS_STD_DEV,
            DEFAULT_DRIFT_PROCESS_STD_DEV,
            DEFAULT_FORGET_FACTOR,
            DEFAULT_ADAPTIVE_CUTOFF,
            DEFAULT_MIN_SAMPLES_FOR_FORGETTING,
        )
    }
}

/// Hand-off to the playback scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Decoded chunks waiting for playback
    pub queue_capacity: usize,
    /// Bytes of chunk memory the decoder may hold at once
    pub chunk_memory_budget: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_memory_budget: DEFAULT_CHUNK_MEMORY_BUDGET,
        }
    }
}
