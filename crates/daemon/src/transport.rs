// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Transport Module
// The seam between the connection manager and the SSH client implementation

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use sshtunnel_common::Session;

use crate::auth::AuthContext;
use crate::debug_log::SessionLog;
use crate::error::TransportError;
use crate::known_hosts::KnownHosts;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(40);
pub const KEEPALIVE_MAX: usize = 2;

/// Cipher suite appended after the session's own preferences
pub const DEFAULT_CIPHERS: &str =
    "aes128-gcm@openssh.com,chacha20-poly1305@openssh.com,aes128-cbc,aes128-ctr";

/// Compression negotiation list used when a session enables compression
pub const COMPRESSION_ALGORITHMS: &str = "zlib@openssh.com,zlib,none";

/// Byte stream carried by a forwarding channel
pub trait ForwardStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardStream for T {}

/// An established, authenticated SSH connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the underlying connection is still open (cached flag, no round trip)
    fn is_connected(&self) -> bool;

    /// Open a direct-tcpip channel to `host:port` on the remote side
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, TransportError>;

    /// Ask the server to listen on `bind_address:bind_port` and relay to `target_host:target_port` locally
    async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), TransportError>;

    async fn cancel_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), TransportError>;

    /// Active liveness check: run a no-op remote command over a fresh channel
    async fn probe(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Establishes transports for sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        session: &Session,
        auth: Arc<dyn AuthContext>,
        log: SessionLog,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Parameters applied to every new transport
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Trust store consulted for host key verification
    pub known_hosts_path: PathBuf,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Missed keepalives before the connection is considered dead
    pub keepalive_max: usize,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        let known_hosts_path =
            KnownHosts::ssh_known_hosts_path().unwrap_or_else(|_| PathBuf::from("known_hosts"));
        Self {
            known_hosts_path,
            connect_timeout: CONNECT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_max: KEEPALIVE_MAX,
        }
    }
}
