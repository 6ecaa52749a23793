// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Connection Monitor
// Background loop that evicts dropped sessions and notifies an observer

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sshtunnel_common::Session;

use crate::manager::ConnectionManager;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Receives connectivity notifications from the monitor
///
/// Callbacks run on the monitor task and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_session_disconnected(&self, session: &Session);

    /// Fired once after a sweep that evicted at least one session
    fn on_connection_status_changed(&self);
}

/// A tracked session plus the registration it came from
struct Tracked {
    id: u64,
    session: Session,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically checks tracked sessions and disconnects the ones that dropped
#[derive(Clone)]
pub struct ConnectionMonitor {
    manager: ConnectionManager,
    interval: Duration,
    active_probe: bool,
    sessions: Arc<Mutex<HashMap<String, Tracked>>>,
    next_id: Arc<AtomicU64>,
    observer: Arc<RwLock<Option<Arc<dyn ConnectionObserver>>>>,
    task: Arc<tokio::sync::Mutex<Option<MonitorTask>>>,
}

impl ConnectionMonitor {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            interval: DEFAULT_MONITOR_INTERVAL,
            active_probe: true,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            observer: Arc::new(RwLock::new(None)),
            task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Also run the exec probe during sweeps, not just the transport's closed flag
    pub fn with_active_probe(mut self, active_probe: bool) -> Self {
        self.active_probe = active_probe;
        self
    }

    /// Track a session; replaces any session tracked under the same name
    pub fn add_session(&self, session: Session) {
        debug!("Monitoring session {}", session.name);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .insert(session.name.clone(), Tracked { id, session });
    }

    /// Stop tracking a session; it is neither checked nor reported afterwards
    pub fn remove_session(&self, session_name: &str) -> Option<Session> {
        self.sessions
            .lock()
            .remove(session_name)
            .map(|tracked| tracked.session)
    }

    /// Names of tracked sessions, sorted
    pub fn tracked_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register the observer; a previously registered one is replaced
    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Start the background loop; no-op if it is already running
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("Connection monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let monitor = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { monitor.run(token).await });

        *task = Some(MonitorTask { cancel, handle });
        info!("Connection monitor started (interval {:?})", self.interval);
    }

    /// Stop the background loop and wait for it; an in-flight sweep finishes first
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(MonitorTask { cancel, handle }) = task.take() else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            error!("Connection monitor task failed: {}", e);
        }
        info!("Connection monitor stopped");
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Run each sweep on its own task so a panic cannot take the loop down
            let monitor = self.clone();
            if let Err(e) = tokio::spawn(async move { monitor.sweep().await }).await {
                error!("Connection monitor sweep failed: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("Connection monitor loop exited");
    }

    /// One pass over every tracked session
    ///
    /// Returns the number of sessions evicted.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(u64, Session)> = self
            .sessions
            .lock()
            .values()
            .map(|tracked| (tracked.id, tracked.session.clone()))
            .collect();
        let mut evicted = 0;

        for (id, session) in snapshot {
            if !self.is_tracked(&session.name, id) {
                continue;
            }
            // Re-checked under the session lock so a concurrent reconnect wins
            if !self
                .manager
                .disconnect_if_dead(&session, self.active_probe)
                .await
            {
                continue;
            }

            warn!("Session {} lost its connection", session.name);
            self.untrack(&session.name, id);
            evicted += 1;
            self.notify(|observer| observer.on_session_disconnected(&session));
        }

        if evicted > 0 {
            self.notify(|observer| observer.on_connection_status_changed());
        }
        evicted
    }

    fn is_tracked(&self, session_name: &str, id: u64) -> bool {
        self.sessions
            .lock()
            .get(session_name)
            .is_some_and(|tracked| tracked.id == id)
    }

    /// Drop the entry only if it is still the registration that was checked
    fn untrack(&self, session_name: &str, id: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(session_name).is_some_and(|tracked| tracked.id == id) {
            sessions.remove(session_name);
        }
    }

    /// Invoke the observer; a panicking observer is logged and does not stop the sweep
    fn notify(&self, callback: impl FnOnce(&dyn ConnectionObserver)) {
        let Some(observer) = self.observer.read().clone() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(observer.as_ref()))).is_err() {
            error!("Connection observer panicked");
        }
    }
}
