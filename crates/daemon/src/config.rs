// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Daemon Config Module
// Timeouts, monitor settings and file locations for the daemon runner

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::known_hosts::KnownHosts;
use crate::transport::{ConnectSettings, CONNECT_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_MAX};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Path to SSH known_hosts file
    /// Default: ~/.ssh/known_hosts
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// Session definitions
    /// Default: ~/.config/sshtunnel-ng/sessions.toml
    #[serde(default = "default_sessions_path")]
    pub sessions_path: PathBuf,

    /// Seconds allowed for TCP connect, handshake and authentication
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds between SSH keepalive messages
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Missed keepalives before a connection is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Seconds between monitor sweeps
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,

    /// Seconds allowed for one liveness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    /// Run a remote `true` on every sweep instead of trusting the transport state
    #[serde(default = "default_active_probe")]
    pub active_probe: bool,

    /// Sessions to connect at startup; empty means all
    #[serde(default)]
    pub autoconnect: Vec<String>,
}

fn default_known_hosts_path() -> PathBuf {
    KnownHosts::ssh_known_hosts_path().unwrap_or_else(|_| PathBuf::from("known_hosts"))
}

fn default_sessions_path() -> PathBuf {
    sshtunnel_common::default_sessions_path().unwrap_or_else(|_| PathBuf::from("sessions.toml"))
}

fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT.as_secs()
}

fn default_keepalive_interval() -> u64 {
    KEEPALIVE_INTERVAL.as_secs()
}

fn default_keepalive_max() -> usize {
    KEEPALIVE_MAX
}

fn default_monitor_interval() -> u64 {
    crate::monitor::DEFAULT_MONITOR_INTERVAL.as_secs()
}

fn default_probe_timeout() -> u64 {
    crate::manager::DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_active_probe() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            known_hosts_path: default_known_hosts_path(),
            sessions_path: default_sessions_path(),
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            monitor_interval: default_monitor_interval(),
            probe_timeout: default_probe_timeout(),
            active_probe: default_active_probe(),
            autoconnect: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("monitor_interval", self.monitor_interval),
            ("probe_timeout", self.probe_timeout),
        ];
        for (name, value) in durations {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.keepalive_max == 0 {
            anyhow::bail!("keepalive_max must be greater than 0");
        }

        if self.probe_timeout >= self.monitor_interval {
            anyhow::bail!(
                "probe_timeout ({}s) must be shorter than monitor_interval ({}s)",
                self.probe_timeout,
                self.monitor_interval
            );
        }

        Ok(())
    }

    /// Load daemon configuration from the default location, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load daemon configuration from a specific path, creating it with defaults if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("sshtunnel-ng").join("daemon.toml"))
    }

    /// Transport parameters derived from this configuration
    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            known_hosts_path: self.known_hosts_path.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    /// Whether a session should be connected at startup
    pub fn should_autoconnect(&self, session_name: &str) -> bool {
        self.autoconnect.is_empty() || self.autoconnect.iter().any(|n| n == session_name)
    }
}
