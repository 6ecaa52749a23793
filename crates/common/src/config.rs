// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// Configuration structures for SSHTunnel NG

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AuthMethod, TunnelDirection};

const DEFAULT_SSH_PORT: u16 = 22;

/// A session to an SSH host and the tunnels carried over it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session name (identity)
    pub name: String,
    /// SSH server hostname or IP
    pub hostname: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication material
    #[serde(default)]
    pub auth: AuthMethod,
    /// Preferred ciphers, comma separated, tried before the default suite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphers: Option<String>,
    /// Enable SSH compression
    #[serde(default)]
    pub compression: bool,
    /// Directory receiving the per-session transport debug log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_log_path: Option<PathBuf>,
    /// Tunnels opened once the session is connected
    #[serde(default, rename = "tunnel")]
    pub tunnels: Vec<Tunnel>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Session {
    /// Create a session with default port, no auth material and no tunnels
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth: AuthMethod::None,
            ciphers: None,
            compression: false,
            debug_log_path: None,
            tunnels: Vec::new(),
        }
    }

    /// Reset the recorded error of every tunnel
    pub fn clear_tunnel_errors(&self) {
        for tunnel in &self.tunnels {
            tunnel.clear_error();
        }
    }

    /// Validate the session configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("Session name cannot be empty".to_string()));
        }
        if self.hostname.trim().is_empty() {
            return Err(Error::Config(format!("{}: hostname cannot be empty", self.name)));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config(format!("{}: username cannot be empty", self.name)));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("{}: port must be greater than 0", self.name)));
        }
        if let AuthMethod::IdentityFile { path, .. } = &self.auth {
            if path.as_os_str().is_empty() {
                return Err(Error::Config(format!(
                    "{}: identity file path required for key authentication",
                    self.name
                )));
            }
        }
        for tunnel in &self.tunnels {
            tunnel.validate().map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("{}: {}", self.name, msg)),
                other => other,
            })?;
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session ({}: {}@{}", self.name, self.username, self.hostname)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        write!(f, ")")
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Session {}

impl PartialOrd for Session {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Session {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

/// One port forward belonging to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    /// Forward direction
    pub direction: TunnelDirection,
    /// Local address (bind address for local forwards, target for remote forwards)
    #[serde(default = "default_local_address")]
    pub local_address: String,
    pub local_port: u16,
    /// Remote address (target for local forwards, bind address for remote forwards)
    pub remote_address: String,
    pub remote_port: u16,
    /// Last error captured while starting this tunnel
    #[serde(skip)]
    error: TunnelErrorSlot,
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

impl Tunnel {
    pub fn new(
        direction: TunnelDirection,
        local_address: impl Into<String>,
        local_port: u16,
        remote_address: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            direction,
            local_address: local_address.into(),
            local_port,
            remote_address: remote_address.into(),
            remote_port,
            error: TunnelErrorSlot::default(),
        }
    }

    pub fn local(
        local_address: impl Into<String>,
        local_port: u16,
        remote_address: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self::new(TunnelDirection::Local, local_address, local_port, remote_address, remote_port)
    }

    pub fn remote(
        local_address: impl Into<String>,
        local_port: u16,
        remote_address: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self::new(TunnelDirection::Remote, local_address, local_port, remote_address, remote_port)
    }

    /// Last recorded error, if any
    pub fn error(&self) -> Option<String> {
        self.error.get()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.error.set(error.into());
    }

    pub fn clear_error(&self) {
        self.error.clear();
    }

    /// Validate the forward configuration
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(Error::Config(format!("{}: local port required", self)));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(format!("{}: remote port required", self)));
        }
        if self.remote_address.trim().is_empty() {
            return Err(Error::Config(format!("{}: remote address required", self)));
        }
        if self.local_address.trim().is_empty() {
            return Err(Error::Config(format!("{}: local address required", self)));
        }
        Ok(())
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            TunnelDirection::Local => write!(
                f,
                "L {}:{} -> {}:{}",
                self.local_address, self.local_port, self.remote_address, self.remote_port
            ),
            TunnelDirection::Remote => write!(
                f,
                "R {}:{} <- {}:{}",
                self.local_address, self.local_port, self.remote_address, self.remote_port
            ),
        }
    }
}

// Two tunnels are the same forward when their endpoints match; the error slot is not part of it
impl PartialEq for Tunnel {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.local_address == other.local_address
            && self.local_port == other.local_port
            && self.remote_address == other.remote_address
            && self.remote_port == other.remote_port
    }
}

impl Eq for Tunnel {}

/// Error cell shared by every clone of a tunnel
#[derive(Debug, Clone, Default)]
struct TunnelErrorSlot(Arc<Mutex<Option<String>>>);

impl TunnelErrorSlot {
    fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    fn set(&self, error: String) {
        *self.0.lock() = Some(error);
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }
}
