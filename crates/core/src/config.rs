use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PIPENEST_DATA_DIR";

pub const DEFAULT_MAX_DEPTH: u32 = 10;
pub const DEFAULT_MAX_TOTAL_STEPS: u64 = 1000;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 512;

/// Ceiling no configuration or per-invocation override may exceed.
pub const HARD_LIMITS: LimitsConfig = LimitsConfig {
    max_depth: 64,
    max_total_steps: 100_000,
    max_memory_mb: 16_384,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub traces_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_depth: u32,
    pub max_total_steps: u64,
    pub max_memory_mb: u64,
}

/// Per-invocation limit overrides. Unset fields keep the base value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitOverrides {
    pub max_depth: Option<u32>,
    pub max_total_steps: Option<u64>,
    pub max_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub slow_span_ms: u64,
    pub min_success_rate: f64,
    pub deep_nesting_depth: u32,
    pub parallelize_depth: u32,
    pub cache_pipeline_count: usize,
    pub trend_threshold: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            limits: LimitsConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            traces_dir: PathBuf::from("traces"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_total_steps: DEFAULT_MAX_TOTAL_STEPS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            slow_span_ms: 5000,
            min_success_rate: 90.0,
            deep_nesting_depth: 5,
            parallelize_depth: 3,
            cache_pipeline_count: 10,
            trend_threshold: 5.0,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            bail!("limits.max_depth must be a positive integer");
        }
        if self.max_total_steps == 0 {
            bail!("limits.max_total_steps must be a positive integer");
        }
        if self.max_memory_mb == 0 {
            bail!("limits.max_memory_mb must be a positive integer");
        }
        Ok(())
    }

    /// Clamp every limit to [`HARD_LIMITS`].
    pub fn clamped(self) -> Self {
        let clamped = Self {
            max_depth: self.max_depth.min(HARD_LIMITS.max_depth),
            max_total_steps: self.max_total_steps.min(HARD_LIMITS.max_total_steps),
            max_memory_mb: self.max_memory_mb.min(HARD_LIMITS.max_memory_mb),
        };
        if clamped != self {
            warn!(
                requested = ?self,
                applied = ?clamped,
                "Limits exceed the hard ceiling; clamping"
            );
        }
        clamped
    }

    pub fn apply_overrides(&self, overrides: Option<&LimitOverrides>) -> Self {
        let Some(overrides) = overrides else {
            return *self;
        };

        Self {
            max_depth: positive_or(overrides.max_depth, self.max_depth),
            max_total_steps: positive_or(overrides.max_total_steps, self.max_total_steps),
            max_memory_mb: positive_or(overrides.max_memory_mb, self.max_memory_mb),
        }
        .clamped()
    }
}

fn positive_or<T: PartialEq + Default + Copy>(value: Option<T>, fallback: T) -> T {
    match value {
        Some(v) if v != T::default() => v,
        _ => fallback,
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .limits
            .validate()
            .with_context(|| format!("invalid limits in {}", path.display()))?;
        config.limits = config.limits.clamped();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `PIPENEST_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
