// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// Common types for SSHTunnel NG

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Direction of a port forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// Local port forwarding (bind local port, forward to remote)
    Local,
    /// Remote port forwarding (bind remote port, forward to local)
    Remote,
}

impl fmt::Display for TunnelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelDirection::Local => write!(f, "L"),
            TunnelDirection::Remote => write!(f, "R"),
        }
    }
}

/// How a session authenticates against the SSH server
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication; prompts through the auth context when no password is stored
    Password {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Private key file with an optional passphrase
    IdentityFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// No stored material; the server decides and the auth context answers prompts
    #[default]
    None,
}

// Manual Debug impl so stored secrets never reach the logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { password } => f
                .debug_struct("Password")
                .field("stored", &password.is_some())
                .finish(),
            AuthMethod::IdentityFile { path, passphrase } => f
                .debug_struct("IdentityFile")
                .field("path", path)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
            AuthMethod::None => write!(f, "None"),
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password { password } => password.zeroize(),
            AuthMethod::IdentityFile { passphrase, .. } => passphrase.zeroize(),
            AuthMethod::None => {}
        }
    }
}

/// Type of input the transport needs from the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequestType {
    /// SSH key passphrase needed
    KeyPassphrase,
    /// SSH password needed
    Password,
    /// Keyboard-interactive prompt (generic, includes 2FA codes)
    KeyboardInteractive,
    /// SSH host key verification needed (first connection)
    HostKeyVerification,
}

/// Authentication request handed to the auth context
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Name of the session this request is for
    pub session_name: String,
    /// Type of authentication needed
    pub auth_type: AuthRequestType,
    /// Prompt to display to user
    pub prompt: String,
    /// Whether input should be hidden (like passwords)
    pub hidden: bool,
}
