use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tasks the dependency scheduler runs at once.
    pub max_parallelism: usize,
    /// Responses kept in the dispatcher cache.
    pub cache_capacity: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    pub quality: QualityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            cache_capacity: 256,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window_secs: u64,
    pub safety_margin: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 50,
            window_secs: 60,
            safety_margin: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ceiling_secs: u64,
    pub base_secs: u64,
    pub per_1k_tokens_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ceiling_secs: 300,
            base_secs: 30,
            per_1k_tokens_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub default_threshold: f64,
    /// Per task kind.
    pub thresholds: BTreeMap<String, f64>,
    pub max_improvement_rounds: u32,
    pub rescore_improved: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            default_threshold: 70.0,
            thresholds: BTreeMap::new(),
            max_improvement_rounds: 1,
            rescore_improved: false,
        }
    }
}

impl Config {
    pub fn docflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".docflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::docflow_dir()?.join("docflow.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_parallelism = config.max_parallelism,
            max_calls = config.rate_limit.max_calls,
            window_secs = config.rate_limit.window_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::docflow_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating docflow directory");
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(Error::Config("max_parallelism must be at least 1".into()));
        }
        if self.rate_limit.max_calls == 0 {
            return Err(Error::Config("rate_limit.max_calls must be at least 1".into()));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(Error::Config("rate_limit.window_secs must be at least 1".into()));
        }
        let margin = self.rate_limit.safety_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            return Err(Error::Config(format!(
                "rate_limit.safety_margin must be in (0, 1], got {}",
                margin
            )));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(Error::Config(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.timeout.ceiling_secs == 0 {
            return Err(Error::Config("timeout.ceiling_secs must be at least 1".into()));
        }
        if !self.quality.default_threshold.is_finite() {
            return Err(Error::Config("quality.default_threshold must be a number".into()));
        }
        if let Some((kind, _)) = self.quality.thresholds.iter().find(|(_, t)| !t.is_finite()) {
            return Err(Error::Config(format!(
                "quality.thresholds.{} must be a number",
                kind
            )));
        }
        Ok(())
    }
}
