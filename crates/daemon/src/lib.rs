// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Daemon Library
// Connection manager, liveness monitor and the russh transport behind them

pub mod auth;
pub mod config;
pub mod debug_log;
pub mod error;
pub mod known_hosts;
pub mod manager;
pub mod monitor;
pub mod socket_registry;
pub mod ssh;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{non_interactive, AuthContext, NonInteractive};
pub use config::DaemonConfig;
pub use error::{AuthError, ConnectionError, TransportError, TunnelError};
pub use manager::{ConnectionEvent, ConnectionManager, TunnelUpdateStatus};
pub use monitor::{ConnectionMonitor, ConnectionObserver};
pub use ssh::SshConnector;
pub use transport::{ConnectSettings, Connector, Transport};
