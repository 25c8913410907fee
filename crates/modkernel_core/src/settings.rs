//! Kernel settings.
//!
//! # Responsibility
//! - Resolve kernel-wide knobs from defaults, an optional TOML file and
//!   `MODKERNEL_*` environment overrides, in that order.
//!
//! # Invariants
//! - A settings value returned by `load`/`resolve` has passed `validate`.

use crate::error::{KernelError, KernelResult};
use crate::imc::{DEFAULT_BLOCK_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use crate::logging::default_log_level;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_DIR: &str = "MODKERNEL_CONFIG_DIR";
pub const ENV_QUEUE_CAPACITY: &str = "MODKERNEL_QUEUE_CAPACITY";
pub const ENV_BLOCK_TIMEOUT_MS: &str = "MODKERNEL_BLOCK_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "MODKERNEL_LOG_LEVEL";

const DEFAULT_CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelSettings {
    /// Directory holding one `<mod>.toml` document per mod.
    pub config_dir: PathBuf,
    pub default_queue_capacity: usize,
    pub block_timeout_ms: u64,
    pub log_level: String,
    /// Absolute directory for rolling log files; logging stays off when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            default_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT.as_millis() as u64,
            log_level: default_log_level().to_string(),
            log_dir: None,
        }
    }
}

impl KernelSettings {
    /// Defaults rooted at `config_dir`.
    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    /// Reads a settings file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> KernelResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| KernelError::io(path, err))?;
        let settings: Self = toml::from_str(&text).map_err(|err| KernelError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults, then `path` when given, then process environment.
    pub fn resolve(path: Option<&Path>) -> KernelResult<Self> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let settings = base.with_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies `MODKERNEL_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> KernelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CONFIG_DIR) {
            self.config_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            self.default_queue_capacity = parse_number(ENV_QUEUE_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BLOCK_TIMEOUT_MS) {
            self.block_timeout_ms = parse_number(ENV_BLOCK_TIMEOUT_MS, &raw)?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level.trim().to_string();
        }
        Ok(self)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.config_dir.as_os_str().is_empty() {
            return Err(KernelError::InvalidArgument(
                "config_dir cannot be empty".to_string(),
            ));
        }
        if self.default_queue_capacity == 0 {
            return Err(KernelError::InvalidArgument(
                "default_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "log_level cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> KernelResult<T> {
    raw.trim().parse::<T>().map_err(|_| {
        KernelError::InvalidArgument(format!("{name} must be a non-negative integer, got `{raw}`"))
    })
}
