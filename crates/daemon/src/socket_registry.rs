// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Socket Registry
// Listening sockets opened for local forwards, keyed by (bind address, port)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sshtunnel_common::format_host_port;

use crate::error::TunnelError;

type ListenerKey = (String, u16);

/// Tracks the accept loops that own local-forward listeners
///
/// Each listener is owned by exactly one accept task. Closing a key aborts
/// that task and waits for it, which drops the listener and releases the port.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    listeners: Arc<Mutex<HashMap<ListenerKey, JoinHandle<()>>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listening socket for a local forward
    pub async fn bind(&self, address: &str, port: u16) -> Result<TcpListener, TunnelError> {
        let addr = format_host_port(address, port);

        match TcpListener::bind(addr.as_str()).await {
            Ok(listener) => {
                debug!("Bound local forward listener on {}", addr);
                Ok(listener)
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(TunnelError::PermissionDenied { addr, port })
            }
            Err(source) => Err(TunnelError::Bind { addr, source }),
        }
    }

    /// Take ownership of the task serving `(address, port)`
    ///
    /// A task already tracked under the same key is aborted.
    pub fn track(&self, address: &str, port: u16, handle: JoinHandle<()>) {
        let previous = self
            .listeners
            .lock()
            .insert((address.to_string(), port), handle);
        if let Some(previous) = previous {
            warn!(
                "Replacing tracked listener on {}",
                format_host_port(address, port)
            );
            previous.abort();
        }
    }

    pub fn is_tracked(&self, address: &str, port: u16) -> bool {
        self.listeners
            .lock()
            .contains_key(&(address.to_string(), port))
    }

    /// Force-close the listener on `(address, port)`
    ///
    /// Returns false when nothing was tracked under the key.
    pub async fn close(&self, address: &str, port: u16) -> bool {
        let handle = self.listeners.lock().remove(&(address.to_string(), port));
        let Some(handle) = handle else {
            return false;
        };

        handle.abort();
        // The listener is dropped once the aborted task has finished
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!(
                    "Listener task on {} ended abnormally: {}",
                    format_host_port(address, port),
                    e
                );
            }
        }
        debug!("Closed listener on {}", format_host_port(address, port));
        true
    }

    /// Close every tracked listener
    pub async fn close_all(&self) {
        let handles: Vec<(ListenerKey, JoinHandle<()>)> =
            self.listeners.lock().drain().collect();
        for ((address, port), handle) in handles {
            handle.abort();
            let _ = handle.await;
            debug!("Closed listener on {}", format_host_port(&address, port));
        }
    }
}
