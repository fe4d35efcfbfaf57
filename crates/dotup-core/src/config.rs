use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_LOCK_RETRY_MS: u64 = 100;
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 600;

/// Settings read from `dotup.toml`. Every field is optional; missing fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub storage_root: Option<PathBuf>,
    pub install_dir_name: Option<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_lock_retry_ms() -> u64 {
    DEFAULT_LOCK_RETRY_MS
}

fn default_install_timeout_secs() -> u64 {
    DEFAULT_INSTALL_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: None,
            install_dir_name: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_retry_ms: DEFAULT_LOCK_RETRY_MS,
            install_timeout_secs: DEFAULT_INSTALL_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse dotup config")
    }

    /// Loads the config at `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load config: {}", path.display()))
    }
}
