// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// Error types for the connection manager and SSH transport

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by the SSH transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Server did not answer an authentication request within {0:?}")]
    AuthTimeout(Duration),

    #[error("Host key for {0} was not accepted")]
    HostKeyRejected(String),

    #[error("known_hosts update failed: {0}")]
    KnownHosts(String),

    #[error("Failed to load SSH key from {path}: {reason}")]
    Key { path: PathBuf, reason: String },

    #[error("Credentials unavailable: {0}")]
    Credentials(#[from] AuthError),

    #[error("Server refused {0}")]
    Refused(String),

    #[error("Channel closed before the command completed")]
    ChannelClosed,

    #[error("Remote command exited with status {0}")]
    ExitStatus(u32),

    #[error("Liveness probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Transport is closed")]
    Closed,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure establishing a session
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Invalid session configuration: {0}")]
    InvalidSession(#[from] sshtunnel_common::Error),

    #[error("Failed to open debug log {path}: {source}")]
    DebugLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect session {session}: {source}")]
    Transport {
        session: String,
        #[source]
        source: TransportError,
    },
}

/// Failure starting or stopping one tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Session {0} is not connected")]
    NotConnected(String),

    #[error("Tunnel {0} is already started")]
    AlreadyStarted(String),

    #[error(
        "Permission denied binding to {addr}. Port {port} is privileged (<=1024) and requires elevated permissions"
    )]
    PermissionDenied { addr: String, port: u16 },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel {tunnel} failed: {source}")]
    Transport {
        tunnel: String,
        #[source]
        source: TransportError,
    },
}

/// Failure obtaining input from the auth context
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no interactive credential source available")]
    Unavailable,

    #[error("authentication prompt failed: {0}")]
    Prompt(String),
}
