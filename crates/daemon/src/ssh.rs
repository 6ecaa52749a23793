// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSHTunnel NG Contributors

// SSHTunnel NG - SSH Module
// russh-backed implementation of the transport seam

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use russh::client::{self, Config, Handle, Msg};
use russh::keys::PublicKey;
use russh::{cipher, compression, Channel, ChannelMsg, Disconnect, Preferred};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use sshtunnel_common::{format_host_port, AuthRequestType, Session};

use crate::auth::{self, AuthContext};
use crate::debug_log::SessionLog;
use crate::error::TransportError;
use crate::known_hosts::{calculate_fingerprint, key_type_to_string, KnownHosts, VerifyResult};
use crate::transport::{
    ConnectSettings, Connector, ForwardStream, Transport, COMPRESSION_ALGORITHMS, DEFAULT_CIPHERS,
};

/// Remote forwards requested on one connection: (bind address, bind port) -> local target
type RemoteForwardTable = Arc<RwLock<HashMap<(String, u32), (String, u16)>>>;

/// Host key seen during key exchange that known_hosts does not list yet
type UnconfirmedKey = Arc<Mutex<Option<PublicKey>>>;

/// Opens russh client connections
pub struct SshConnector {
    settings: ConnectSettings,
}

impl SshConnector {
    pub fn new(settings: ConnectSettings) -> Self {
        Self { settings }
    }

    fn client_config(&self, session: &Session) -> Config {
        Config {
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            nodelay: true,
            preferred: preferred_algorithms(session),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        session: &Session,
        auth: Arc<dyn AuthContext>,
        log: SessionLog,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let config = Arc::new(self.client_config(session));
        let remote_forwards = RemoteForwardTable::default();
        let unconfirmed_key = UnconfirmedKey::default();

        let handler = ClientHandler {
            session: session.clone(),
            known_hosts_path: self.settings.known_hosts_path.clone(),
            unconfirmed_key: unconfirmed_key.clone(),
            remote_forwards: remote_forwards.clone(),
            log: log.clone(),
        };

        let addr = format_host_port(&session.hostname, session.port);
        info!("Connecting to SSH server: {}", addr);
        log.info(format!("Connecting to {} as {}", addr, session.username));

        // TCP connect and key exchange share one deadline; user prompts come after it
        let timeout = self.settings.connect_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = |log: &SessionLog| {
            log.error(format!("Connection to {} timed out after {:?}", addr, timeout));
            TransportError::ConnectTimeout {
                addr: addr.clone(),
                timeout,
            }
        };

        let stream = match timeout_at(deadline, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log.error(format!("Connection to {} failed: {}", addr, e));
                return Err(TransportError::Connect {
                    addr: addr.clone(),
                    source: e.into(),
                });
            }
            Err(_) => return Err(timed_out(&log)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let mut handle =
            match timeout_at(deadline, client::connect_stream(config, stream, handler)).await {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => {
                    log.error(format!("Connection to {} failed: {}", addr, e));
                    return Err(TransportError::Connect {
                        addr: addr.clone(),
                        source: e,
                    });
                }
                Err(_) => return Err(timed_out(&log)),
            };

        // No credentials go out before an unknown host key is accepted
        let unknown_key = unconfirmed_key.lock().take();
        if let Some(key) = unknown_key {
            if let Err(e) =
                confirm_host_key(session, &self.settings.known_hosts_path, &key, auth.as_ref(), &log)
                    .await
            {
                close_handle(&handle, "host key not accepted").await;
                return Err(e);
            }
        }

        if let Err(e) = auth::authenticate(&mut handle, session, auth.as_ref(), &log, timeout).await
        {
            log.error(format!("Authentication failed: {}", e));
            close_handle(&handle, "authentication failed").await;
            return Err(e);
        }

        info!("SSH authentication successful for {}", addr);
        log.info("Authentication succeeded");

        Ok(Arc::new(SshTransport {
            handle: tokio::sync::Mutex::new(handle),
            closed: AtomicBool::new(false),
            remote_forwards,
            log,
        }))
    }
}

async fn close_handle(handle: &Handle<ClientHandler>, reason: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, reason, "en")
        .await
    {
        debug!("Failed to disconnect ({}): {}", reason, e);
    }
}

/// Ask the user to accept a host key known_hosts does not list, and record it on yes
async fn confirm_host_key(
    session: &Session,
    known_hosts_path: &Path,
    key: &PublicKey,
    ctx: &dyn AuthContext,
    log: &SessionLog,
) -> Result<(), TransportError> {
    let host = session.hostname.as_str();
    let port = session.port;
    let fingerprint = calculate_fingerprint(key);
    let prompt = format!(
        "The authenticity of host '{}:{}' can't be established.\n\
         {} key fingerprint is {}.\n\
         Are you sure you want to continue connecting? (yes/no)",
        host,
        port,
        key_type_to_string(key),
        fingerprint
    );

    let response = match auth::request(ctx, session, AuthRequestType::HostKeyVerification, prompt, false)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Host key for {}:{} not confirmed: {}", host, port, e);
            log.warn(format!("Unknown host key {} not confirmed", fingerprint));
            return Err(e.into());
        }
    };

    let answer = response.trim().to_lowercase();
    if answer != "yes" && answer != "y" {
        warn!("Host key rejected by user for {}:{}", host, port);
        log.warn(format!("Rejected host key {}", fingerprint));
        return Err(TransportError::HostKeyRejected(format!(
            "{} ({})",
            format_host_port(host, port),
            fingerprint
        )));
    }

    let mut known_hosts = KnownHosts::load_from(known_hosts_path)
        .map_err(|e| TransportError::KnownHosts(e.to_string()))?;
    known_hosts
        .append(host, port, key)
        .map_err(|e| TransportError::KnownHosts(e.to_string()))?;

    info!("Host key accepted and saved for {}:{}", host, port);
    log.info(format!("Accepted host key {}", fingerprint));
    Ok(())
}

/// Session ciphers first, then the default suite; compression when enabled
fn preferred_algorithms(session: &Session) -> Preferred {
    let mut preferred = Preferred::default();

    if let Some(ciphers) = session.ciphers.as_deref().filter(|c| !c.trim().is_empty()) {
        let list = format!("{},{}", ciphers, DEFAULT_CIPHERS);
        let names: Vec<cipher::Name> = negotiation_list(&list);
        if names.is_empty() {
            warn!("No supported cipher in '{}', using defaults", ciphers);
        } else {
            preferred.cipher = Cow::Owned(names);
        }
    }

    if session.compression {
        let names: Vec<compression::Name> = negotiation_list(COMPRESSION_ALGORITHMS);
        if !names.is_empty() {
            preferred.compression = Cow::Owned(names);
        }
    }

    preferred
}

/// Parse a comma separated algorithm list, dropping duplicates and names russh does not know
fn negotiation_list<N>(list: &str) -> Vec<N>
where
    N: for<'a> TryFrom<&'a str> + PartialEq,
{
    let mut names = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match N::try_from(item) {
            Ok(name) if !names.contains(&name) => names.push(name),
            Ok(_) => {}
            Err(_) => debug!("Skipping unsupported algorithm: {}", item),
        }
    }
    names
}

/// An authenticated russh client connection
pub struct SshTransport {
    // Forward requests need the handle mutably
    handle: tokio::sync::Mutex<Handle<ClientHandler>>,
    closed: AtomicBool,
    remote_forwards: RemoteForwardTable,
    log: SessionLog,
}

#[async_trait]
impl Transport for SshTransport {
    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.handle.try_lock() {
            Ok(handle) => !handle.is_closed(),
            // Busy with a request, so the session loop was alive a moment ago
            Err(_) => true,
        }
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ForwardStream>, TransportError> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(
                host,
                port.into(),
                originator.ip().to_string(),
                originator.port().into(),
            )
            .await?;
        self.log
            .debug(format!("direct-tcpip channel to {}:{} for {}", host, port, originator));
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), TransportError> {
        let key = (bind_address.to_string(), u32::from(bind_port));
        self.remote_forwards
            .write()
            .insert(key.clone(), (target_host.to_string(), target_port));

        let reply = self
            .handle
            .lock()
            .await
            .tcpip_forward(bind_address, bind_port.into())
            .await;
        if let Err(e) = reply {
            self.remote_forwards.write().remove(&key);
            self.log.error(format!(
                "tcpip-forward {}:{} refused: {}",
                bind_address, bind_port, e
            ));
            return Err(TransportError::Refused(format!(
                "remote forward on {}:{} ({})",
                bind_address, bind_port, e
            )));
        }

        self.log.info(format!(
            "Remote forward {}:{} -> {}:{}",
            bind_address, bind_port, target_host, target_port
        ));
        Ok(())
    }

    async fn cancel_remote_forward(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), TransportError> {
        self.remote_forwards
            .write()
            .remove(&(bind_address.to_string(), u32::from(bind_port)));
        self.handle
            .lock()
            .await
            .cancel_tcpip_forward(bind_address, bind_port.into())
            .await?;
        self.log
            .info(format!("Cancelled remote forward {}:{}", bind_address, bind_port));
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let mut channel = self.handle.lock().await.channel_open_session().await?;
        channel.exec(true, "true").await?;

        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                    break;
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        if let Err(e) = channel.close().await {
            debug!("Failed to close probe channel: {}", e);
        }

        match exit_status {
            Some(0) => Ok(()),
            Some(status) => Err(TransportError::ExitStatus(status)),
            None => Err(TransportError::ChannelClosed),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.remote_forwards.write().clear();
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        self.log.info("Disconnected");
        Ok(())
    }
}

/// russh client callbacks: host key verification and incoming remote-forward channels
struct ClientHandler {
    session: Session,
    known_hosts_path: PathBuf,
    unconfirmed_key: UnconfirmedKey,
    remote_forwards: RemoteForwardTable,
    log: SessionLog,
}

impl ClientHandler {
    fn lookup_forward(&self, address: &str, port: u32) -> Option<(String, u16)> {
        let forwards = self.remote_forwards.read();
        if let Some(target) = forwards.get(&(address.to_string(), port)) {
            return Some(target.clone());
        }
        // Servers may report a different spelling of the bind address
        forwards
            .iter()
            .find(|((_, bound_port), _)| *bound_port == port)
            .map(|(_, target)| target.clone())
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let host = self.session.hostname.clone();
        let port = self.session.port;

        let known_hosts = KnownHosts::load_from(&self.known_hosts_path).map_err(|e| {
            russh::Error::from(std::io::Error::other(format!(
                "Failed to load known_hosts: {}",
                e
            )))
        })?;

        match known_hosts.verify(&host, port, server_public_key) {
            VerifyResult::Trusted => {
                info!("Host key verified for {}:{}", host, port);
                self.log.debug(format!("Host key for {}:{} is trusted", host, port));
                Ok(true)
            }

            VerifyResult::Unknown => {
                // Confirmed with the user once key exchange is done
                let fingerprint = calculate_fingerprint(server_public_key);
                debug!("Unknown host key for {}:{}: {}", host, port, fingerprint);
                self.log
                    .debug(format!("Host key {} is not in known_hosts", fingerprint));
                *self.unconfirmed_key.lock() = Some(server_public_key.clone());
                Ok(true)
            }

            VerifyResult::Mismatch {
                actual_fingerprint,
                line_number,
            } => {
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @");
                error!("@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@");
                error!("IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!");
                error!("Host: {}:{}", host, port);
                error!("Actual fingerprint: {}", actual_fingerprint);
                error!(
                    "Offending key in {} line {}",
                    known_hosts.path().display(),
                    line_number
                );
                self.log.fatal(format!(
                    "Host key mismatch for {}:{} ({})",
                    host, port, actual_fingerprint
                ));
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some((target_host, target_port)) = self.lookup_forward(connected_address, connected_port)
        else {
            warn!(
                "No remote forward registered for {}:{}, dropping channel",
                connected_address, connected_port
            );
            return Ok(());
        };

        self.log.debug(format!(
            "forwarded-tcpip {}:{} from {}:{} -> {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port,
            target_host,
            target_port
        ));

        // Called from the session event loop, so the relay runs on its own task
        tokio::spawn(async move {
            let addr = format_host_port(&target_host, target_port);
            let mut stream = match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to connect remote forward target {}: {}", addr, e);
                    return;
                }
            };
            let mut channel_stream = channel.into_stream();
            match copy_bidirectional(&mut stream, &mut channel_stream).await {
                Ok((to_remote, to_local)) => debug!(
                    "Remote forward connection to {} closed: {} bytes out, {} bytes in",
                    addr, to_remote, to_local
                ),
                Err(e) => debug!("Remote forward connection to {} ended: {}", addr, e),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PrivateKey};
    use russh::server::{self, Auth};
    use russh::{MethodKind, MethodSet};
    use sshtunnel_common::{AuthMethod, AuthRequest};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use zeroize::Zeroizing;

    use crate::error::AuthError;

    /// Global requests seen by the test server
    #[derive(Clone, Default)]
    struct ServerRequests(Arc<Mutex<Vec<String>>>);

    impl ServerRequests {
        fn snapshot(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct TestServer {
        requests: ServerRequests,
    }

    impl server::Handler for TestServer {
        type Error = russh::Error;

        async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
            Ok(Auth::Accept)
        }

        async fn tcpip_forward(
            &mut self,
            address: &str,
            port: &mut u32,
            _session: &mut server::Session,
        ) -> Result<bool, Self::Error> {
            self.requests.0.lock().push(format!("forward {}:{}", address, port));
            Ok(true)
        }

        async fn cancel_tcpip_forward(
            &mut self,
            address: &str,
            port: u32,
            _session: &mut server::Session,
        ) -> Result<bool, Self::Error> {
            self.requests.0.lock().push(format!("cancel {}:{}", address, port));
            Ok(true)
        }
    }

    /// Start an SSH server on a loopback port that accepts any password
    async fn start_server(requests: ServerRequests) -> u16 {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            keys: vec![key],
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = TestServer {
                    requests: requests.clone(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });
        port
    }

    /// Answers every request with `answer` after `delay`
    struct SlowAnswer {
        delay: Duration,
        answer: &'static str,
        asked: AtomicUsize,
    }

    impl SlowAnswer {
        fn new(delay: Duration, answer: &'static str) -> Arc<Self> {
            Arc::new(Self {
                delay,
                answer,
                asked: AtomicUsize::new(0),
            })
        }

        fn asked(&self) -> usize {
            self.asked.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthContext for SlowAnswer {
        async fn request_input(&self, request: AuthRequest) -> Result<Zeroizing<String>, AuthError> {
            assert_eq!(request.auth_type, AuthRequestType::HostKeyVerification);
            self.asked.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Zeroizing::new(self.answer.to_string()))
        }
    }

    fn test_session(port: u16) -> Session {
        let mut session = Session::new("local", "127.0.0.1", "tester");
        session.port = port;
        session.auth = AuthMethod::Password {
            password: Some("secret".to_string()),
        };
        session
    }

    fn test_connector(dir: &TempDir, connect_timeout: Duration) -> SshConnector {
        SshConnector::new(ConnectSettings {
            known_hosts_path: dir.path().join("known_hosts"),
            connect_timeout,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_host_key_prompt_does_not_count_against_connect_timeout() {
        let port = start_server(ServerRequests::default()).await;
        let dir = TempDir::new().unwrap();
        let connector = test_connector(&dir, Duration::from_millis(300));
        let session = test_session(port);

        let auth = SlowAnswer::new(Duration::from_millis(600), "yes");
        let transport = connector
            .connect(&session, auth.clone(), SessionLog::disabled())
            .await
            .unwrap();
        assert!(transport.is_connected());
        assert_eq!(auth.asked(), 1);

        let known_hosts = std::fs::read_to_string(dir.path().join("known_hosts")).unwrap();
        assert!(known_hosts.contains(&format!("[127.0.0.1]:{}", port)));
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());

        // Second connect trusts the recorded key without asking
        let transport = connector
            .connect(&session, auth.clone(), SessionLog::disabled())
            .await
            .unwrap();
        assert_eq!(auth.asked(), 1);
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_host_key_fails_connect_without_recording() {
        let port = start_server(ServerRequests::default()).await;
        let dir = TempDir::new().unwrap();
        let connector = test_connector(&dir, Duration::from_secs(5));

        let auth = SlowAnswer::new(Duration::ZERO, "no");
        let result = connector
            .connect(&test_session(port), auth, SessionLog::disabled())
            .await;

        assert!(matches!(result, Err(TransportError::HostKeyRejected(_))));
        assert!(!dir.path().join("known_hosts").exists());
    }

    #[tokio::test]
    async fn test_remote_forward_request_and_cancel_reach_server() {
        let requests = ServerRequests::default();
        let port = start_server(requests.clone()).await;
        let dir = TempDir::new().unwrap();
        let connector = test_connector(&dir, Duration::from_secs(5));

        let auth = SlowAnswer::new(Duration::ZERO, "yes");
        let transport = connector
            .connect(&test_session(port), auth, SessionLog::disabled())
            .await
            .unwrap();

        transport
            .request_remote_forward("127.0.0.1", 9022, "127.0.0.1", 22)
            .await
            .unwrap();
        assert_eq!(requests.snapshot(), vec!["forward 127.0.0.1:9022".to_string()]);

        transport.cancel_remote_forward("127.0.0.1", 9022).await.unwrap();
        assert_eq!(
            requests.snapshot(),
            vec![
                "forward 127.0.0.1:9022".to_string(),
                "cancel 127.0.0.1:9022".to_string()
            ]
        );

        transport.disconnect().await.unwrap();
    }

    #[test]
    fn test_negotiation_list_drops_unknown_and_duplicates() {
        let names: Vec<compression::Name> =
            negotiation_list("zlib@openssh.com, bogus ,zlib,none,zlib");
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_preferred_algorithms_layers_session_ciphers() {
        let mut session = Session::new("db", "host", "user");
        session.ciphers = Some("aes256-ctr".to_string());
        let preferred = preferred_algorithms(&session);
        assert_eq!(preferred.cipher.first(), cipher::Name::try_from("aes256-ctr").ok().as_ref());
    }

    #[test]
    fn test_preferred_algorithms_defaults_without_options() {
        let session = Session::new("db", "host", "user");
        let preferred = preferred_algorithms(&session);
        assert_eq!(preferred.cipher, Preferred::default().cipher);
        assert_eq!(preferred.compression, Preferred::default().compression);
    }
}
