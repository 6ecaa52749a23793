// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Connection Manager
// Owns the registry of live SSH transports and the forwards running on them

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use sshtunnel_common::{is_loopback_address, Session, Tunnel, TunnelDirection};

use crate::auth::AuthContext;
use crate::debug_log::SessionLog;
use crate::error::{ConnectionError, TransportError, TunnelError};
use crate::socket_registry::SocketRegistry;
use crate::transport::{Connector, Transport};

/// Upper bound for the liveness probe and for teardown round trips
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle notifications published by the manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { session: String },
    Disconnected { session: String },
    TunnelStarted { session: String, tunnel: String },
    TunnelStopped { session: String, tunnel: String },
    TunnelFailed { session: String, tunnel: String, error: String },
}

/// Outcome of a tunnel edit against a possibly connected session
#[derive(Debug)]
pub enum TunnelUpdateStatus {
    /// The change was applied to the live transport
    Applied,
    /// The session is not connected; nothing to do
    NotConnected,
    Failed(Vec<TunnelError>),
}

impl TunnelUpdateStatus {
    /// 0 for success or no-op, -1 when any step failed
    pub fn code(&self) -> i32 {
        match self {
            TunnelUpdateStatus::Failed(_) => -1,
            _ => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 0
    }

    pub fn errors(&self) -> &[TunnelError] {
        match self {
            TunnelUpdateStatus::Failed(errors) => errors,
            _ => &[],
        }
    }
}

struct LiveConnection {
    transport: Arc<dyn Transport>,
    /// Forwards currently running on the transport
    active: Vec<Tunnel>,
    log: SessionLog,
    connected_at: DateTime<Utc>,
}

/// Session name -> live transport registry plus tunnel control
///
/// Cloning is cheap; all clones share the same registry.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    registry: Arc<RwLock<HashMap<String, LiveConnection>>>,
    session_locks: Arc<parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    sockets: SocketRegistry,
    probe_timeout: Duration,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            connector,
            registry: Arc::new(RwLock::new(HashMap::new())),
            session_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            sockets: SocketRegistry::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            event_tx,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Connect a session and start its tunnels
    ///
    /// Reuses a live transport if one exists and only starts the tunnels that are
    /// not running yet. Tunnel failures are recorded on the tunnel and do not fail
    /// the connect.
    pub async fn connect(
        &self,
        session: &Session,
        auth: Arc<dyn AuthContext>,
    ) -> Result<(), ConnectionError> {
        let lock = self.session_lock(&session.name);
        let guard = lock.lock().await;

        let result = self.connect_locked(session, auth).await;
        if result.is_err() {
            self.prune_session_lock(&session.name, &lock);
        }
        drop(guard);
        result
    }

    async fn connect_locked(
        &self,
        session: &Session,
        auth: Arc<dyn AuthContext>,
    ) -> Result<(), ConnectionError> {
        let name = session.name.clone();
        session.clear_tunnel_errors();

        let existing = {
            let registry = self.registry.read().await;
            registry
                .get(&name)
                .map(|conn| (conn.transport.clone(), conn.log.clone()))
        };

        if let Some((transport, log)) = existing {
            if transport.is_connected() {
                debug!("Session {} already connected, reusing transport", name);
                self.start_inactive_tunnels(session, &transport, &log).await;
                return Ok(());
            }
            warn!("Session {} has a stale transport, replacing it", name);
            self.teardown(&name).await;
        }

        session.validate()?;

        let log = SessionLog::for_session(session).map_err(|source| ConnectionError::DebugLog {
            path: session.debug_log_path.clone().unwrap_or_default(),
            source,
        })?;

        info!("Connecting {}", session);
        let transport = self
            .connector
            .connect(session, auth, log.clone())
            .await
            .map_err(|source| {
                error!("Failed to connect {}: {}", session, source);
                ConnectionError::Transport {
                    session: name.clone(),
                    source,
                }
            })?;

        self.registry.write().await.insert(
            name.clone(),
            LiveConnection {
                transport: transport.clone(),
                active: Vec::new(),
                log: log.clone(),
                connected_at: Utc::now(),
            },
        );
        info!("Session {} connected", name);
        self.emit(ConnectionEvent::Connected {
            session: name.clone(),
        });

        self.start_inactive_tunnels(session, &transport, &log).await;
        Ok(())
    }

    /// Disconnect a session, stopping every forward it carries
    ///
    /// No-op when the session is not connected.
    pub async fn disconnect(&self, session: &Session) {
        let lock = self.session_lock(&session.name);
        let _guard = lock.lock().await;

        session.clear_tunnel_errors();
        if !self.teardown(&session.name).await {
            debug!("Session {} is not connected", session.name);
        }
        self.prune_session_lock(&session.name, &lock);
    }

    /// Disconnect the session only if it is still dead once its lock is held
    ///
    /// Dead means not registered, transport closed, or (with `active_probe`)
    /// failing the bounded liveness check. A session reconnected in the meantime is left
    /// alone. Returns true when the session was found dead.
    pub async fn disconnect_if_dead(&self, session: &Session, active_probe: bool) -> bool {
        let lock = self.session_lock(&session.name);
        let _guard = lock.lock().await;

        let transport = self
            .registry
            .read()
            .await
            .get(&session.name)
            .map(|conn| conn.transport.clone());

        let dead = match transport {
            None => true,
            Some(transport) if !transport.is_connected() => true,
            Some(transport) if active_probe => match self.probe(&transport).await {
                Some(e) => {
                    debug!("Session {} failed liveness check: {}", session.name, e);
                    true
                }
                None => false,
            },
            Some(_) => false,
        };

        if dead {
            session.clear_tunnel_errors();
            self.teardown(&session.name).await;
            self.prune_session_lock(&session.name, &lock);
        }
        dead
    }

    /// Disconnect every registered session
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for name in names {
            let lock = self.session_lock(&name);
            let _guard = lock.lock().await;
            self.teardown(&name).await;
            self.prune_session_lock(&name, &lock);
        }
        self.sockets.close_all().await;
        info!("All sessions disconnected");
    }

    /// Whether the registry holds a transport for the session that is still open
    pub async fn is_connected(&self, session_name: &str) -> bool {
        self.registry
            .read()
            .await
            .get(session_name)
            .is_some_and(|conn| conn.transport.is_connected())
    }

    /// Actively probe the session's transport
    ///
    /// Returns `None` when the probe succeeds or the session is not registered.
    pub async fn session_error(&self, session_name: &str) -> Option<TransportError> {
        let transport = self
            .registry
            .read()
            .await
            .get(session_name)
            .map(|conn| conn.transport.clone())?;

        self.probe(&transport).await
    }

    /// Names of all registered sessions, sorted
    pub async fn connected_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connected_since(&self, session_name: &str) -> Option<DateTime<Utc>> {
        self.registry
            .read()
            .await
            .get(session_name)
            .map(|conn| conn.connected_at)
    }

    /// Forwards currently running for the session
    pub async fn active_tunnels(&self, session_name: &str) -> Vec<Tunnel> {
        self.registry
            .read()
            .await
            .get(session_name)
            .map(|conn| conn.active.clone())
            .unwrap_or_default()
    }

    pub async fn start_tunnel_if_connected(
        &self,
        session: &Session,
        tunnel: &Tunnel,
    ) -> TunnelUpdateStatus {
        let lock = self.session_lock(&session.name);
        let _guard = lock.lock().await;

        let Some((transport, log)) = self.live(&session.name).await else {
            debug!("Session {} not connected, not starting {}", session.name, tunnel);
            self.prune_session_lock(&session.name, &lock);
            return TunnelUpdateStatus::NotConnected;
        };

        match self.start_tunnel(&session.name, &transport, &log, tunnel).await {
            Ok(()) => TunnelUpdateStatus::Applied,
            Err(e) => {
                self.record_start_failure(&session.name, &log, tunnel, &e);
                TunnelUpdateStatus::Failed(vec![e])
            }
        }
    }

    pub async fn stop_tunnel_if_connected(
        &self,
        session: &Session,
        tunnel: &Tunnel,
    ) -> TunnelUpdateStatus {
        let lock = self.session_lock(&session.name);
        let _guard = lock.lock().await;

        let Some((transport, log)) = self.live(&session.name).await else {
            debug!("Session {} not connected, not stopping {}", session.name, tunnel);
            self.prune_session_lock(&session.name, &lock);
            return TunnelUpdateStatus::NotConnected;
        };

        match self.stop_tunnel(&session.name, &transport, tunnel).await {
            Ok(()) => TunnelUpdateStatus::Applied,
            Err(e) => {
                error!("Failed to stop {} on {}: {}", tunnel, session.name, e);
                log.error(format!("Failed to stop {}: {}", tunnel, e));
                TunnelUpdateStatus::Failed(vec![e])
            }
        }
    }

    /// Replace `previous` with `tunnel`; the new tunnel is started even if stopping the old one failed
    pub async fn change_tunnel_if_connected(
        &self,
        session: &Session,
        tunnel: &Tunnel,
        previous: &Tunnel,
    ) -> TunnelUpdateStatus {
        let lock = self.session_lock(&session.name);
        let _guard = lock.lock().await;

        let Some((transport, log)) = self.live(&session.name).await else {
            debug!("Session {} not connected, not changing {}", session.name, previous);
            self.prune_session_lock(&session.name, &lock);
            return TunnelUpdateStatus::NotConnected;
        };

        let mut errors = Vec::new();

        if let Err(e) = self.stop_tunnel(&session.name, &transport, previous).await {
            error!("Failed to stop {} on {}: {}", previous, session.name, e);
            log.error(format!("Failed to stop {}: {}", previous, e));
            errors.push(e);
        }

        tunnel.clear_error();
        if let Err(e) = self.start_tunnel(&session.name, &transport, &log, tunnel).await {
            self.record_start_failure(&session.name, &log, tunnel, &e);
            errors.push(e);
        }

        if errors.is_empty() {
            TunnelUpdateStatus::Applied
        } else {
            TunnelUpdateStatus::Failed(errors)
        }
    }

    fn session_lock(&self, session_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .entry(session_name.to_string())
            .or_default()
            .clone()
    }

    /// Forget an idle session lock; call with its guard held, as the last step
    fn prune_session_lock(&self, session_name: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.session_locks.lock();
        // Only the map and the caller reference it, so nobody else waits on it
        let idle = locks
            .get(session_name)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(session_name);
        }
    }

    /// Exec check bounded by the probe timeout; `None` when healthy
    async fn probe(&self, transport: &Arc<dyn Transport>) -> Option<TransportError> {
        match tokio::time::timeout(self.probe_timeout, transport.probe()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(TransportError::ProbeTimeout(self.probe_timeout)),
        }
    }

    /// Transport and log for a registered, still open session
    async fn live(&self, session_name: &str) -> Option<(Arc<dyn Transport>, SessionLog)> {
        self.registry
            .read()
            .await
            .get(session_name)
            .filter(|conn| conn.transport.is_connected())
            .map(|conn| (conn.transport.clone(), conn.log.clone()))
    }

    async fn start_inactive_tunnels(
        &self,
        session: &Session,
        transport: &Arc<dyn Transport>,
        log: &SessionLog,
    ) {
        let active = self.active_tunnels(&session.name).await;
        for tunnel in session.tunnels.iter().filter(|t| !active.contains(t)) {
            if let Err(e) = self.start_tunnel(&session.name, transport, log, tunnel).await {
                self.record_start_failure(&session.name, log, tunnel, &e);
            }
        }
    }

    fn record_start_failure(
        &self,
        session_name: &str,
        log: &SessionLog,
        tunnel: &Tunnel,
        err: &TunnelError,
    ) {
        error!("Failed to start {} on {}: {}", tunnel, session_name, err);
        log.error(format!("Failed to start {}: {}", tunnel, err));
        tunnel.set_error(err.to_string());
        self.emit(ConnectionEvent::TunnelFailed {
            session: session_name.to_string(),
            tunnel: tunnel.to_string(),
            error: err.to_string(),
        });
    }

    /// Start one forward and mark it active; callers hold the session lock
    async fn start_tunnel(
        &self,
        session_name: &str,
        transport: &Arc<dyn Transport>,
        log: &SessionLog,
        tunnel: &Tunnel,
    ) -> Result<(), TunnelError> {
        if self.active_tunnels(session_name).await.contains(tunnel) {
            return Err(TunnelError::AlreadyStarted(tunnel.to_string()));
        }

        match tunnel.direction {
            TunnelDirection::Local => {
                if !is_loopback_address(&tunnel.local_address) {
                    warn!(
                        "{} listens on non-loopback address {}, reachable from the network",
                        tunnel, tunnel.local_address
                    );
                }
                let listener = self
                    .sockets
                    .bind(&tunnel.local_address, tunnel.local_port)
                    .await?;
                let handle = tokio::spawn(serve_local_forward(
                    listener,
                    transport.clone(),
                    tunnel.remote_address.clone(),
                    tunnel.remote_port,
                    log.clone(),
                ));
                self.sockets
                    .track(&tunnel.local_address, tunnel.local_port, handle);
            }
            TunnelDirection::Remote => {
                transport
                    .request_remote_forward(
                        &tunnel.remote_address,
                        tunnel.remote_port,
                        &tunnel.local_address,
                        tunnel.local_port,
                    )
                    .await
                    .map_err(|source| TunnelError::Transport {
                        tunnel: tunnel.to_string(),
                        source,
                    })?;
            }
        }

        let registered = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(session_name) {
                Some(conn) => {
                    conn.active.push(tunnel.clone());
                    true
                }
                None => false,
            }
        };
        if !registered {
            // Session went away underneath us; do not leak the forward
            if let Err(e) = self.stop_forward(transport, tunnel).await {
                debug!("Failed to release orphaned {}: {}", tunnel, e);
            }
            return Err(TunnelError::NotConnected(session_name.to_string()));
        }

        info!("Started {} on {}", tunnel, session_name);
        log.info(format!("Started {}", tunnel));
        self.emit(ConnectionEvent::TunnelStarted {
            session: session_name.to_string(),
            tunnel: tunnel.to_string(),
        });
        Ok(())
    }

    /// Stop one forward if it is active; callers hold the session lock
    async fn stop_tunnel(
        &self,
        session_name: &str,
        transport: &Arc<dyn Transport>,
        tunnel: &Tunnel,
    ) -> Result<(), TunnelError> {
        let was_active = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(session_name) {
                Some(conn) => match conn.active.iter().position(|t| t == tunnel) {
                    Some(idx) => {
                        conn.active.remove(idx);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };

        if !was_active {
            debug!("{} is not running on {}", tunnel, session_name);
            return Ok(());
        }

        self.stop_forward(transport, tunnel).await?;

        info!("Stopped {} on {}", tunnel, session_name);
        self.emit(ConnectionEvent::TunnelStopped {
            session: session_name.to_string(),
            tunnel: tunnel.to_string(),
        });
        Ok(())
    }

    /// Release the OS or server side resources of a forward
    async fn stop_forward(
        &self,
        transport: &Arc<dyn Transport>,
        tunnel: &Tunnel,
    ) -> Result<(), TunnelError> {
        match tunnel.direction {
            TunnelDirection::Local => {
                self.sockets
                    .close(&tunnel.local_address, tunnel.local_port)
                    .await;
                Ok(())
            }
            TunnelDirection::Remote => {
                let cancel =
                    transport.cancel_remote_forward(&tunnel.remote_address, tunnel.remote_port);
                match tokio::time::timeout(self.probe_timeout, cancel).await {
                    Ok(result) => result.map_err(|source| TunnelError::Transport {
                        tunnel: tunnel.to_string(),
                        source,
                    }),
                    Err(_) => Err(TunnelError::Transport {
                        tunnel: tunnel.to_string(),
                        source: TransportError::ProbeTimeout(self.probe_timeout),
                    }),
                }
            }
        }
    }

    /// Remove the registry entry, stop its forwards and close the transport
    ///
    /// Returns false when nothing was registered. Callers hold the session lock.
    async fn teardown(&self, session_name: &str) -> bool {
        let Some(conn) = self.registry.write().await.remove(session_name) else {
            return false;
        };

        for tunnel in &conn.active {
            if let Err(e) = self.stop_forward(&conn.transport, tunnel).await {
                debug!("Ignoring failure stopping {} on {}: {}", tunnel, session_name, e);
            }
        }

        match tokio::time::timeout(self.probe_timeout, conn.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing transport for {}: {}", session_name, e),
            Err(_) => debug!("Timed out closing transport for {}", session_name),
        }

        conn.log.info("Disconnected");
        info!("Session {} disconnected", session_name);
        self.emit(ConnectionEvent::Disconnected {
            session: session_name.to_string(),
        });
        true
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

/// Accept loop for a local forward; runs until its task is aborted
async fn serve_local_forward(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    target_host: String,
    target_port: u16,
    log: SessionLog,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept forward connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        debug!("Accepted forward connection from {}", peer);
        let transport = transport.clone();
        let target_host = target_host.clone();
        let log = log.clone();

        tokio::spawn(async move {
            let mut channel = match open_channel(&transport, &target_host, target_port, peer).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        "Failed to open channel to {}:{} for {}: {}",
                        target_host, target_port, peer, e
                    );
                    log.warn(format!(
                        "direct-tcpip to {}:{} failed: {}",
                        target_host, target_port, e
                    ));
                    return;
                }
            };

            match copy_bidirectional(&mut socket, &mut channel).await {
                Ok((sent, received)) => debug!(
                    "Forward connection from {} closed: {} bytes sent, {} bytes received",
                    peer, sent, received
                ),
                Err(e) => debug!("Forward connection from {} ended: {}", peer, e),
            }
        });
    }
}

async fn open_channel(
    transport: &Arc<dyn Transport>,
    host: &str,
    port: u16,
    peer: SocketAddr,
) -> Result<Box<dyn crate::transport::ForwardStream>, TransportError> {
    if !transport.is_connected() {
        return Err(TransportError::Closed);
    }
    transport.open_direct_tcpip(host, port, peer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::non_interactive;
    use crate::testing::{free_port, MockConnector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn manager(connector: &Arc<MockConnector>) -> ConnectionManager {
        ConnectionManager::new(connector.clone())
    }

    fn session(name: &str) -> Session {
        Session::new(name, format!("{}.example.com", name), "deploy")
    }

    #[tokio::test]
    async fn test_connect_disconnect_round_trip() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");

        manager.connect(&session, non_interactive()).await.unwrap();
        assert!(manager.is_connected("db").await);
        assert_eq!(manager.connected_sessions().await, vec!["db".to_string()]);
        assert!(manager.connected_since("db").await.is_some());
        assert!(manager.session_error("db").await.is_none());

        manager.disconnect(&session).await;
        assert!(!manager.is_connected("db").await);
        assert!(manager.connected_sessions().await.is_empty());
        assert_eq!(connector.last_transport().unwrap().disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_never_connected_session() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");

        assert!(!manager.is_connected("db").await);
        assert!(manager.session_error("db").await.is_none());
        assert!(manager.active_tunnels("db").await.is_empty());

        // Disconnecting something that never connected is a no-op
        manager.disconnect(&session).await;
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_reuses_live_transport() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");

        manager.connect(&session, non_interactive()).await.unwrap();
        manager.connect(&session, non_interactive()).await.unwrap();

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(manager.connected_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_replaces_stale_transport() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");

        manager.connect(&session, non_interactive()).await.unwrap();
        let first = connector.last_transport().unwrap();
        first.drop_connection();
        assert!(!manager.is_connected("db").await);

        manager.connect(&session, non_interactive()).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(manager.connected_sessions().await.len(), 1);
        assert_eq!(first.disconnect_count(), 1);
        assert!(manager.is_connected("db").await);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_registered() {
        let connector = MockConnector::new();
        connector.fail_host("db.example.com");
        let manager = manager(&connector);

        let err = manager
            .connect(&session("db"), non_interactive())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Transport { ref session, .. } if session == "db"));
        assert!(!manager.is_connected("db").await);
        assert!(manager.connected_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_session_is_rejected_before_connecting() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = Session::new("db", "", "deploy");

        let err = manager.connect(&session, non_interactive()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidSession(_)));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_one_failing_tunnel_does_not_affect_others() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let local_port = free_port();

        // Hold the port so the local forward cannot bind
        let blocker = std::net::TcpListener::bind(("127.0.0.1", local_port)).unwrap();

        let mut session = session("db");
        session.tunnels = vec![
            Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080),
            Tunnel::local("127.0.0.1", local_port, "db.internal", 5432),
            Tunnel::remote("127.0.0.1", 8081, "0.0.0.0", 9081),
        ];

        manager.connect(&session, non_interactive()).await.unwrap();
        assert!(manager.is_connected("db").await);

        assert!(session.tunnels[0].error().is_none());
        assert!(session.tunnels[1].error().is_some());
        assert!(session.tunnels[2].error().is_none());

        let active = manager.active_tunnels("db").await;
        assert_eq!(active.len(), 2);
        assert!(!active.contains(&session.tunnels[1]));

        drop(blocker);
    }

    #[tokio::test]
    async fn test_tunnel_errors_cleared_on_disconnect() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let mut session = session("db");
        session.tunnels = vec![Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080)];

        manager.connect(&session, non_interactive()).await.unwrap();
        session.tunnels[0].set_error("stale failure");

        manager.disconnect(&session).await;
        assert!(session.tunnels[0].error().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_starts_only_inactive_tunnels() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let mut session = session("db");
        session.tunnels = vec![Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080)];

        manager.connect(&session, non_interactive()).await.unwrap();
        session
            .tunnels
            .push(Tunnel::remote("127.0.0.1", 8081, "0.0.0.0", 9081));
        manager.connect(&session, non_interactive()).await.unwrap();

        let transport = connector.last_transport().unwrap();
        assert_eq!(transport.remote_forwards.lock().len(), 2);
        assert_eq!(manager.active_tunnels("db").await.len(), 2);
        assert!(session.tunnels.iter().all(|t| t.error().is_none()));
    }

    #[tokio::test]
    async fn test_local_forward_relays_and_frees_port() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let port = free_port();
        let tunnel = Tunnel::local("127.0.0.1", port, "db.internal", 5432);
        let mut session = session("db");
        session.tunnels = vec![tunnel.clone()];

        manager.connect(&session, non_interactive()).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let status = manager.stop_tunnel_if_connected(&session, &tunnel).await;
        assert!(matches!(status, TunnelUpdateStatus::Applied));
        assert!(manager.active_tunnels("db").await.is_empty());

        // Port is free for someone else
        let rebound = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_frees_local_forward_ports() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let port = free_port();
        let mut session = session("db");
        session.tunnels = vec![Tunnel::local("127.0.0.1", port, "db.internal", 5432)];

        manager.connect(&session, non_interactive()).await.unwrap();
        manager.disconnect(&session).await;

        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_started() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        let tunnel = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080);

        manager.connect(&session, non_interactive()).await.unwrap();
        let first = manager.start_tunnel_if_connected(&session, &tunnel).await;
        assert_eq!(first.code(), 0);

        let second = manager.start_tunnel_if_connected(&session, &tunnel).await;
        assert_eq!(second.code(), -1);
        assert!(matches!(
            second.errors(),
            [TunnelError::AlreadyStarted(_)]
        ));
        assert!(tunnel.error().is_some());
    }

    #[tokio::test]
    async fn test_tunnel_edits_on_disconnected_session_are_neutral() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        let old = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080);
        let new = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9090);

        let status = manager.change_tunnel_if_connected(&session, &new, &old).await;
        assert!(matches!(status, TunnelUpdateStatus::NotConnected));
        assert_eq!(status.code(), 0);

        assert!(manager.start_tunnel_if_connected(&session, &new).await.is_success());
        assert!(manager.stop_tunnel_if_connected(&session, &old).await.is_success());
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_change_tunnel_swaps_forward() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let old = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080);
        let new = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9090);
        let mut session = session("db");
        session.tunnels = vec![old.clone()];

        manager.connect(&session, non_interactive()).await.unwrap();
        let status = manager.change_tunnel_if_connected(&session, &new, &old).await;
        assert!(matches!(status, TunnelUpdateStatus::Applied));

        let active = manager.active_tunnels("db").await;
        assert_eq!(active, vec![new.clone()]);
        let transport = connector.last_transport().unwrap();
        assert_eq!(
            *transport.remote_forwards.lock(),
            vec![("0.0.0.0".to_string(), 9090)]
        );
    }

    #[tokio::test]
    async fn test_change_tunnel_reports_start_failure() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let old = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080);
        let new = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9090);
        let mut session = session("db");
        session.tunnels = vec![old.clone()];

        manager.connect(&session, non_interactive()).await.unwrap();
        connector.last_transport().unwrap().refuse_port(9090);

        let status = manager.change_tunnel_if_connected(&session, &new, &old).await;
        assert_eq!(status.code(), -1);
        assert_eq!(status.errors().len(), 1);
        assert!(new.error().is_some());
        assert!(manager.active_tunnels("db").await.is_empty());
    }

    #[tokio::test]
    async fn test_session_error_reports_failed_probe() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect(&session("db"), non_interactive()).await.unwrap();

        connector.last_transport().unwrap().fail_probe();
        assert!(matches!(
            manager.session_error("db").await,
            Some(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let mut events = manager.subscribe();
        let session = session("db");

        manager.connect(&session, non_interactive()).await.unwrap();
        manager.disconnect(&session).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { ref session } if session == "db"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected { ref session } if session == "db"
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        manager.connect(&session("a"), non_interactive()).await.unwrap();
        manager.connect(&session("b"), non_interactive()).await.unwrap();

        manager.disconnect_all().await;
        assert!(manager.connected_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_if_dead_leaves_healthy_session() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        manager.connect(&session, non_interactive()).await.unwrap();

        assert!(!manager.disconnect_if_dead(&session, true).await);
        assert!(manager.is_connected("db").await);
        assert_eq!(connector.last_transport().unwrap().disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_if_dead_tears_down_dropped_session() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        manager.connect(&session, non_interactive()).await.unwrap();
        let transport = connector.last_transport().unwrap();
        transport.drop_connection();

        assert!(manager.disconnect_if_dead(&session, false).await);
        assert!(manager.connected_sessions().await.is_empty());
        assert_eq!(transport.disconnect_count(), 1);

        // Unregistered sessions count as dead
        assert!(manager.disconnect_if_dead(&session, false).await);
    }

    #[tokio::test]
    async fn test_disconnect_if_dead_runs_exec_check_only_when_active() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        manager.connect(&session, non_interactive()).await.unwrap();
        connector.last_transport().unwrap().fail_probe();

        assert!(!manager.disconnect_if_dead(&session, false).await);
        assert!(manager.is_connected("db").await);

        assert!(manager.disconnect_if_dead(&session, true).await);
        assert!(!manager.is_connected("db").await);
    }

    #[tokio::test]
    async fn test_disconnect_if_dead_spares_reconnected_session() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let session = session("db");
        manager.connect(&session, non_interactive()).await.unwrap();
        let stale = connector.last_transport().unwrap();
        stale.drop_connection();

        // Reconnected before the sweep got the lock
        manager.connect(&session, non_interactive()).await.unwrap();
        let fresh = connector.last_transport().unwrap();

        assert!(!manager.disconnect_if_dead(&session, false).await);
        assert!(manager.is_connected("db").await);
        assert_eq!(fresh.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_session_locks_released_after_disconnect() {
        let connector = MockConnector::new();
        let manager = manager(&connector);
        let db = session("db");

        manager.connect(&db, non_interactive()).await.unwrap();
        assert_eq!(manager.session_locks.lock().len(), 1);
        manager.disconnect(&db).await;
        assert!(manager.session_locks.lock().is_empty());

        connector.fail_host("down.example.com");
        assert!(manager.connect(&session("down"), non_interactive()).await.is_err());
        assert!(manager.session_locks.lock().is_empty());

        let tunnel = Tunnel::remote("127.0.0.1", 8080, "0.0.0.0", 9080);
        for i in 0..50 {
            let ghost = session(&format!("ghost-{}", i));
            manager.start_tunnel_if_connected(&ghost, &tunnel).await;
            manager.stop_tunnel_if_connected(&ghost, &tunnel).await;
        }
        assert!(manager.session_locks.lock().is_empty());

        manager.connect(&session("a"), non_interactive()).await.unwrap();
        manager.connect(&session("b"), non_interactive()).await.unwrap();
        manager.disconnect_all().await;
        assert!(manager.session_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_session_lock_kept_while_another_call_waits() {
        let connector = MockConnector::new();
        let manager = manager(&connector);

        let lock = manager.session_lock("db");
        let _guard = lock.lock().await;
        let waiting = manager.session_lock("db");

        manager.prune_session_lock("db", &lock);
        assert_eq!(manager.session_locks.lock().len(), 1);
        assert!(Arc::ptr_eq(&waiting, &manager.session_lock("db")));
    }
}
