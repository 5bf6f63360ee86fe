//! Run configuration.
//!
//! Settings come from three places with a fixed, per-field precedence:
//! command line, then config file, then built-in default. Every setting is a
//! named field; there is no generic key/value merging.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::portal::{DEFAULT_ORGANISM, DEFAULT_PORTAL_URL, DEFAULT_SIGNON_URL, PortalSettings};
use crate::verify::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "cds-sync.json";

pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Contents of `cds-sync.json`. Every field is optional.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub base: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub makeblastdb: Option<PathBuf>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_max_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub signon_url: Option<String>,
    #[serde(default)]
    pub organism: Option<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub base: Option<PathBuf>,
    pub user: Option<String>,
    pub makeblastdb: Option<PathBuf>,
    pub threads: Option<usize>,
    pub max_attempts: Option<u32>,
    pub organism: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base: Utf8PathBuf,
    pub user: Option<String>,
    pub makeblastdb: Option<PathBuf>,
    pub threads: usize,
    pub retry: RetryPolicy,
    pub portal: PortalSettings,
}

impl ResolvedConfig {
    /// Field by field: command line if present, else file, else default.
    /// A relative base is anchored at `cwd`.
    pub fn merge(cli: CliOverrides, file: ConfigFile, cwd: &Path) -> Result<Self, SyncError> {
        let base = cli.base.or(file.base).unwrap_or_else(|| cwd.to_path_buf());
        let base = if base.is_absolute() {
            base
        } else {
            cwd.join(base)
        };
        let base = Utf8PathBuf::from_path_buf(base).map_err(|path| {
            SyncError::Filesystem(format!("non-utf8 base directory: {}", path.display()))
        })?;

        let base_delay = Duration::from_millis(
            file.retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
        );
        let max_delay =
            Duration::from_millis(file.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS));
        let max_attempts = cli
            .max_attempts
            .or(file.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            base,
            user: cli.user.or(file.user),
            makeblastdb: cli.makeblastdb.or(file.makeblastdb),
            threads: cli
                .threads
                .or(file.threads)
                .unwrap_or(DEFAULT_THREADS)
                .max(1),
            retry: RetryPolicy::new(max_attempts, base_delay, max_delay),
            portal: PortalSettings {
                portal_url: file
                    .portal_url
                    .unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string()),
                signon_url: file
                    .signon_url
                    .unwrap_or_else(|| DEFAULT_SIGNON_URL.to_string()),
                organism: cli
                    .organism
                    .or(file.organism)
                    .unwrap_or_else(|| DEFAULT_ORGANISM.to_string()),
                timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            },
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load an explicit config file (which must exist) or the first default
    /// file found; no file at all yields an empty config.
    pub fn load(path: Option<&Path>) -> Result<ConfigFile, SyncError> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(SyncError::MissingConfig(path.to_path_buf()));
                }
                path.to_path_buf()
            }
            None => match Self::default_paths().into_iter().find(|path| path.is_file()) {
                Some(path) => path,
                None => return Ok(ConfigFile::default()),
            },
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ConfigFile, SyncError> {
        let config: ConfigFile =
            serde_json::from_str(content).map_err(|err| SyncError::ConfigParse(err.to_string()))?;
        for key in config.unknown.keys() {
            warn!("ignoring unknown config key {key}");
        }
        Ok(config)
    }

    /// `./cds-sync.json`, then `<config dir>/cds-sync/cds-sync.json`.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dirs) = BaseDirs::new() {
            paths.push(dirs.config_dir().join("cds-sync").join(CONFIG_FILE_NAME));
        }
        paths
    }
}
