// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// In-memory transport used by the manager and monitor tests

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sshtunnel_common::Session;

use crate::auth::AuthContext;
use crate::debug_log::SessionLog;
use crate::error::TransportError;
use crate::monitor::ConnectionObserver;
use crate::transport::{Connector, ForwardStream, Transport};

/// Ask the OS for a currently unused loopback port
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Default)]
pub struct MockTransport {
    closed: AtomicBool,
    probe_fails: AtomicBool,
    crash_next_check: AtomicBool,
    checks: AtomicUsize,
    pub remote_forwards: Mutex<Vec<(String, u16)>>,
    /// Remote bind ports the fake server refuses
    pub refused_ports: Mutex<HashSet<u16>>,
    pub disconnects: AtomicUsize,
}

impl MockTransport {
    /// Simulate the server dropping the connection
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Connection still looks open but the probe fails
    pub fn fail_probe(&self) {
        self.probe_fails.store(true, Ordering::SeqCst);
    }

    /// Panic inside the next liveness check, then behave normally
    pub fn crash_next_check(&self) {
        self.crash_next_check.store(true, Ordering::SeqCst);
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn refuse_port(&self, port: u16) {
        self.refused_ports.lock().insert(port);
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn open_direct_tcpip(
        &self,
        _host: &str,
        _port: u16,
        _originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        // The far end of the channel echoes what it receives
        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }

    async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
        _target_host: &str,
        _target_port: u16,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if self.refused_ports.lock().contains(&bind_port) {
            return Err(TransportError::Refused(format!(
                "remote forward on {}:{}",
                bind_address, bind_port
            )));
        }
        self.remote_forwards
            .lock()
            .push((bind_address.to_string(), bind_port));
        Ok(())
    }

    async fn cancel_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), TransportError> {
        let mut forwards = self.remote_forwards.lock();
        let before = forwards.len();
        forwards.retain(|(a, p)| !(a == bind_address && *p == bind_port));
        if forwards.len() == before {
            return Err(TransportError::Refused(format!(
                "cancel of unknown forward {}:{}",
                bind_address, bind_port
            )));
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.crash_next_check.swap(false, Ordering::SeqCst) {
            panic!("liveness check crashed");
        }
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockConnector {
    failing_hosts: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_host(&self, hostname: &str) {
        self.failing_hosts.lock().insert(hostname.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        session: &Session,
        _auth: Arc<dyn AuthContext>,
        log: SessionLog,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing_hosts.lock().contains(&session.hostname) {
            log.error("connection refused");
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        log.info(format!("connected to {}", session.hostname));
        let transport = Arc::new(MockTransport::default());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Observer that records every callback
#[derive(Default)]
pub struct RecordingObserver {
    pub disconnected: Mutex<Vec<String>>,
    pub status_changes: AtomicUsize,
}

impl RecordingObserver {
    pub fn disconnected_sessions(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }

    pub fn status_change_count(&self) -> usize {
        self.status_changes.load(Ordering::SeqCst)
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_session_disconnected(&self, session: &Session) {
        self.disconnected.lock().push(session.name.clone());
    }

    fn on_connection_status_changed(&self) {
        self.status_changes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records callbacks like `RecordingObserver` but panics on the first disconnect notification
#[derive(Default)]
pub struct PanickingObserver {
    pub inner: RecordingObserver,
    panicked: AtomicBool,
}

impl PanickingObserver {
    pub fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }
}

impl ConnectionObserver for PanickingObserver {
    fn on_session_disconnected(&self, session: &Session) {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("observer failed on {}", session.name);
        }
        self.inner.on_session_disconnected(session);
    }

    fn on_connection_status_changed(&self) {
        self.inner.on_connection_status_changed();
    }
}
