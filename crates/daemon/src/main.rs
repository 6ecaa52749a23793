// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - Daemon
// Connects the configured sessions and keeps watch over them

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dialoguer::{Input, Password};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use sshtunnel_common::{load_sessions, AuthRequest, Session};
use sshtunnel_daemon::{
    AuthContext, AuthError, ConnectionManager, ConnectionMonitor, ConnectionObserver,
    DaemonConfig, SshConnector,
};

#[derive(Parser)]
#[command(name = "sshtunnel-daemon")]
#[command(about = "SSHTunnel NG daemon: keeps SSH sessions and their tunnels up", long_about = None)]
#[command(version)]
struct Args {
    /// Path to daemon.toml (default: ~/.config/sshtunnel-ng/daemon.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session to connect; repeat for several. Overrides `autoconnect`
    #[arg(short, long = "session")]
    sessions: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sshtunnel_daemon=debug,sshtunnel_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("SSHTunnel NG daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = match &args.config {
        Some(path) => DaemonConfig::load_from(path)?,
        None => DaemonConfig::load()?,
    };

    let sessions = load_sessions(&daemon_config.sessions_path).context(format!(
        "Failed to load sessions from {}",
        daemon_config.sessions_path.display()
    ))?;
    info!(
        "Loaded {} session(s) from {}",
        sessions.len(),
        daemon_config.sessions_path.display()
    );

    let selected = select_sessions(sessions, &args.sessions, &daemon_config);
    if selected.is_empty() {
        warn!("No sessions selected, nothing to do");
        return Ok(());
    }

    let connector = Arc::new(SshConnector::new(daemon_config.connect_settings()));
    let manager = ConnectionManager::new(connector).with_probe_timeout(daemon_config.probe_timeout());

    // Subscribe to connection events for logging
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Connection event: {:?}", event);
        }
    });

    let monitor = ConnectionMonitor::new(manager.clone())
        .with_interval(daemon_config.monitor_interval())
        .with_active_probe(daemon_config.active_probe);
    monitor.set_observer(Arc::new(LoggingObserver));

    let auth: Arc<dyn AuthContext> = Arc::new(TerminalAuth);
    for session in selected {
        match manager.connect(&session, auth.clone()).await {
            Ok(()) => {
                for tunnel in &session.tunnels {
                    if let Some(err) = tunnel.error() {
                        warn!("{}: {} not started: {}", session.name, tunnel, err);
                    }
                }
                monitor.add_session(session);
            }
            Err(e) => error!("{}", e),
        }
    }

    if monitor.tracked_sessions().is_empty() {
        error!("No session could be connected");
        return Ok(());
    }

    monitor.start().await;
    info!("Daemon started successfully");

    wait_for_shutdown().await?;

    monitor.stop().await;
    manager.disconnect_all().await;
    info!("Daemon shut down");
    Ok(())
}

/// Sessions named on the command line, or the configured autoconnect set
fn select_sessions(sessions: Vec<Session>, requested: &[String], config: &DaemonConfig) -> Vec<Session> {
    if !requested.is_empty() {
        for name in requested {
            if !sessions.iter().any(|s| &s.name == name) {
                warn!("Session not found: {}", name);
            }
        }
        return sessions
            .into_iter()
            .filter(|s| requested.contains(&s.name))
            .collect();
    }

    sessions
        .into_iter()
        .filter(|s| config.should_autoconnect(&s.name))
        .collect()
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        };
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

/// Logs monitor notifications
struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_session_disconnected(&self, session: &Session) {
        warn!("{} disconnected", session);
    }

    fn on_connection_status_changed(&self) {
        info!("Connection status changed");
    }
}

/// Prompts on the controlling terminal
struct TerminalAuth;

#[async_trait]
impl AuthContext for TerminalAuth {
    async fn request_input(&self, request: AuthRequest) -> Result<Zeroizing<String>, AuthError> {
        // dialoguer blocks on stdin
        tokio::task::spawn_blocking(move || prompt_for_auth(&request))
            .await
            .map_err(|e| AuthError::Prompt(e.to_string()))?
    }
}

/// Prompt user for authentication input
fn prompt_for_auth(auth_request: &AuthRequest) -> Result<Zeroizing<String>, AuthError> {
    println!("[{}]", auth_request.session_name);

    // The 'hidden' field (from SSH protocol's 'echo' field) determines input visibility
    let response = if auth_request.hidden {
        Password::new()
            .with_prompt(auth_request.prompt.trim_end())
            .allow_empty_password(true)
            .interact()
    } else {
        Input::<String>::new()
            .with_prompt(auth_request.prompt.trim_end())
            .allow_empty(true)
            .interact_text()
    };

    response
        .map(Zeroizing::new)
        .map_err(|e| AuthError::Prompt(e.to_string()))
}
