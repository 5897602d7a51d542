// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVHOST_BINARY: &str = "/usr/libexec/devhost";
pub const DEFAULT_BIND_RETRIES: u32 = 4;
pub const DEFAULT_BIND_BACKOFF_MS: u64 = 250;
pub const DEFAULT_SUSPEND_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Coordinator configuration, usually read from a TOML file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directories scanned for driver manifests.
    pub driver_search_paths: Vec<PathBuf>,
    /// Manifests loaded before the search paths are scanned.
    pub load_drivers: Vec<PathBuf>,
    /// Library bound to the `sys` device.
    pub sys_device_driver: Option<String>,
    pub devhost_binary: PathBuf,
    pub devhost_args: Vec<String>,
    pub bind_retries: u32,
    pub bind_backoff_ms: u64,
    pub suspend_timeout_ms: u64,
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            driver_search_paths: Vec::new(),
            load_drivers: Vec::new(),
            sys_device_driver: None,
            devhost_binary: PathBuf::from(DEFAULT_DEVHOST_BINARY),
            devhost_args: Vec::new(),
            bind_retries: DEFAULT_BIND_RETRIES,
            bind_backoff_ms: DEFAULT_BIND_BACKOFF_MS,
            suspend_timeout_ms: DEFAULT_SUSPEND_TIMEOUT_MS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CoordinatorConfig =
            toml::from_str(content).context("failed to parse coordinator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_backoff_ms == 0 {
            return Err(anyhow!("bind_backoff_ms must be greater than zero"));
        }
        if self.suspend_timeout_ms == 0 {
            return Err(anyhow!("suspend_timeout_ms must be greater than zero"));
        }
        logging::level_name_to_slog_level(&self.log_level)
            .map_err(|e| anyhow!("log_level: {}", e))?;
        Ok(())
    }

    pub fn bind_backoff(&self) -> Duration {
        Duration::from_millis(self.bind_backoff_ms)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }
}
