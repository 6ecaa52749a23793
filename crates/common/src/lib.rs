// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Common Library
// Session and tunnel records, the sessions file, and shared helpers

pub mod config;
pub mod error;
pub mod network;
pub mod session_store;
pub mod types;

pub use config::{Session, Tunnel};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use session_store::{default_sessions_path, find_session, load_sessions, save_sessions};
pub use types::{AuthMethod, AuthRequest, AuthRequestType, TunnelDirection};
