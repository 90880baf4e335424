//! Tracker configuration with precedence tracking.
//!
//! Precedence (highest to lowest):
//! 1. Explicit overrides (CLI flags)
//! 2. Environment variables (`WEAVEMARK_STATE_DIR`, `WEAVEMARK_WORKERS`,
//!    `WEAVEMARK_PERSIST`)
//! 3. Built-in defaults
//!
//! Malformed environment values are ignored with a warning. Malformed
//! overrides are an error.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// Environment variable naming the state directory.
pub const ENV_STATE_DIR: &str = "WEAVEMARK_STATE_DIR";
/// Environment variable naming the worker count per scheduler.
pub const ENV_WORKERS: &str = "WEAVEMARK_WORKERS";
/// Environment variable toggling persistence.
pub const ENV_PERSIST: &str = "WEAVEMARK_PERSIST";

/// Logical name of the reference registry's state file.
pub const REFERENCES_STATE_FILE: &str = "aop-references.json";
/// Logical name of the metadata registry's state file.
pub const METADATA_STATE_FILE: &str = "bean-metadata.json";

const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

// ============================================================================
// Configuration Sources
// ============================================================================

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    EnvVar = 1,
    /// Explicit override (highest precedence).
    CliFlag = 2,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigSource::Default => "default",
            ConfigSource::EnvVar => "env",
            ConfigSource::CliFlag => "cli",
        })
    }
}

/// A configuration value with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        ConfigValue { value, source }
    }

    /// Keep whichever value has the higher precedence (ties go to `other`).
    pub fn merge(self, other: Self) -> Self {
        if other.source >= self.source {
            other
        } else {
            self
        }
    }
}

/// Explicit overrides, typically from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub state_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub persist: Option<bool>,
}

// ============================================================================
// Resolved Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Directory holding the registries' state files.
    pub state_dir: ConfigValue<PathBuf>,
    /// Worker threads per scheduler (at least one).
    pub workers: ConfigValue<usize>,
    /// Persist registries across restarts.
    pub persist: ConfigValue<bool>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            state_dir: ConfigValue::new(default_state_dir(), ConfigSource::Default),
            workers: ConfigValue::new(DEFAULT_WORKERS, ConfigSource::Default),
            persist: ConfigValue::new(true, ConfigSource::Default),
        }
    }
}

impl TrackerConfig {
    /// Resolve from defaults, the process environment, and `overrides`.
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with(|key| std::env::var(key).ok(), overrides)
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with<F>(env: F, overrides: &ConfigOverrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = TrackerConfig::default();
        config.apply_env(&env);
        config.apply_overrides(overrides)?;
        Ok(config)
    }

    /// Config rooted at `state_dir`, everything else default.
    pub fn in_dir(state_dir: impl Into<PathBuf>) -> Self {
        TrackerConfig {
            state_dir: ConfigValue::new(state_dir.into(), ConfigSource::CliFlag),
            ..TrackerConfig::default()
        }
    }

    fn apply_env<F>(&mut self, env: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env(ENV_STATE_DIR).filter(|d| !d.trim().is_empty()) {
            self.state_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::EnvVar);
        }

        if let Some(raw) = env(ENV_WORKERS) {
            match parse_workers(ENV_WORKERS, &raw) {
                Ok(n) => self.workers = ConfigValue::new(n, ConfigSource::EnvVar),
                Err(e) => warn!(error = %e, "ignoring environment setting"),
            }
        }

        if let Some(raw) = env(ENV_PERSIST) {
            match parse_bool(ENV_PERSIST, &raw) {
                Ok(b) => self.persist = ConfigValue::new(b, ConfigSource::EnvVar),
                Err(e) => warn!(error = %e, "ignoring environment setting"),
            }
        }
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(dir) = &overrides.state_dir {
            self.state_dir = ConfigValue::new(dir.clone(), ConfigSource::CliFlag);
        }
        if let Some(n) = overrides.workers {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "workers",
                    value: n.to_string(),
                    reason: "must be at least 1",
                });
            }
            self.workers = ConfigValue::new(n, ConfigSource::CliFlag);
        }
        if let Some(b) = overrides.persist {
            self.persist = ConfigValue::new(b, ConfigSource::CliFlag);
        }
        Ok(())
    }

    pub fn references_path(&self) -> PathBuf {
        self.state_dir.value.join(REFERENCES_STATE_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.value.join(METADATA_STATE_FILE)
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("weavemark"))
        .unwrap_or_else(|| PathBuf::from(".weavemark"))
}

fn parse_workers(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected a positive integer",
        }),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true or false",
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
