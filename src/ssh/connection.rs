//! Connection Manager
//!
//! Keeps one authenticated SSH transport to a server alive for as long as the
//! process runs. Dependents block on the readiness gate, then borrow the
//! current [`HandleController`] to open channels or remote listeners.
//!
//! ```text
//! Connecting ──connect ok──▶ Connected ──keep-alive fails──▶ Connecting ──▶ ...
//!      │                                                           │
//!      └──────────────── close() / fatal error ──▶ Closed ◀────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::ChannelStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{ForwardRoutes, ForwardedConnection};
use super::endpoint::{Endpoint, SshUrl};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::known_hosts::{HostKeyPolicy, HostKeyVerifier};
use super::proxy::{connect_via_proxy, handshake_only, Credentials, ProxyHop};
use crate::config::{expand_tilde, ClientTransportConfig};

/// Pending forwarded connections buffered per remote listener
const REMOTE_ACCEPT_BACKLOG: usize = 32;

/// Connection status readout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// Reconnecting SSH transport with a readiness gate
pub struct ConnectionManager {
    target: ProxyHop,
    /// Traversal order, nearest hop first
    jump_hosts: Vec<ProxyHop>,
    verifier: HostKeyVerifier,
    reconnect_interval: Duration,
    keepalive_interval: Duration,

    status: RwLock<ConnectionStatus>,
    ready_tx: watch::Sender<bool>,
    controller: RwLock<Option<HandleController>>,
    routes: ForwardRoutes,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(conf: &ClientTransportConfig) -> Result<Arc<Self>, SshError> {
        let url = SshUrl::parse(&conf.server)?;
        let identity = non_empty(&conf.identity).map(expand_tilde);

        let target = ProxyHop {
            host: url.host,
            port: url.port,
            credentials: Credentials {
                username: url.username,
                identity: identity.clone(),
                password: non_empty(&conf.password).map(str::to_string),
            },
        };

        let jump_hosts = conf
            .jump_hosts
            .iter()
            .map(|spec| {
                let url = SshUrl::parse(&spec.uri)?;
                Ok(ProxyHop {
                    host: url.host,
                    port: url.port,
                    credentials: Credentials {
                        username: url.username,
                        identity: non_empty(&spec.identity)
                            .map(expand_tilde)
                            .or_else(|| identity.clone()),
                        password: non_empty(&spec.password).map(str::to_string),
                    },
                })
            })
            .collect::<Result<Vec<_>, SshError>>()?;

        let policy = if conf.insecure {
            HostKeyPolicy::Insecure
        } else {
            HostKeyPolicy::Strict
        };
        let verifier = HostKeyVerifier::new(policy, expand_tilde(&conf.known_hosts));
        let (ready_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            target,
            jump_hosts,
            verifier,
            reconnect_interval: conf.reconnect_interval(),
            keepalive_interval: conf.keepalive_interval(),
            status: RwLock::new(ConnectionStatus::Connecting),
            ready_tx,
            controller: RwLock::new(None),
            routes: ForwardRoutes::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Run the reconnect loop until [`close`](Self::close) or a fatal error.
    ///
    /// Transient failures are retried forever every reconnect interval.
    pub async fn start(&self) -> Result<(), SshError> {
        info!("Connection manager started for {}", self.target.label());

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match attempt {
                Ok(controller) => {
                    if !self.publish(&controller) {
                        // closed while the handshake was finishing
                        controller.disconnect().await;
                        break;
                    }
                    info!("Connected to {}", self.target.label());

                    let lost = tokio::select! {
                        _ = self.shutdown.cancelled() => None,
                        reason = self.keep_alive(&controller) => Some(reason),
                    };

                    self.teardown(controller).await;
                    match lost {
                        Some(reason) => warn!("Connection to {} lost: {}", self.target.label(), reason),
                        None => break,
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Cannot connect to {}: {}", self.target.label(), e);
                    self.mark_closed();
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Connection to {} failed: {}. Retrying in {}s",
                        self.target.label(),
                        e,
                        self.reconnect_interval.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }

        self.mark_closed();
        info!("Connection manager for {} stopped", self.target.label());
        Ok(())
    }

    /// Dial (directly or through the jump chain) and authenticate once
    pub async fn connect(&self) -> Result<HandleController, SshError> {
        let transport = connect_via_proxy(
            &self.jump_hosts,
            &self.target,
            &self.verifier,
            self.routes.clone(),
        )
        .await?;
        Ok(spawn_handle_owner_task(transport, self.target.label()))
    }

    /// Probe the transport every keep-alive interval; returns the first failure
    pub async fn keep_alive(&self, controller: &HandleController) -> SshError {
        let mut disconnect_rx = controller.subscribe_disconnect();
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => return SshError::Disconnected,
                _ = ticker.tick() => match controller.ping().await {
                    PingResult::Ok => {}
                    PingResult::Timeout => {
                        return SshError::ConnectionFailed("keepalive timed out".into());
                    }
                    PingResult::IoError => return SshError::Disconnected,
                },
            }
        }
    }

    /// Close the transport and stop the reconnect loop. Safe to call twice.
    pub async fn close(&self) {
        {
            let mut status = self.status.write();
            self.shutdown.cancel();
            *status = ConnectionStatus::Closed;
        }
        self.ready_tx.send_replace(false);
        self.routes.clear();

        let controller = self.controller.write().take();
        if let Some(controller) = controller {
            controller.disconnect().await;
        }
    }

    /// Block until the transport is authenticated and usable
    pub async fn ready_wait(&self) {
        let mut rx = self.ready_tx.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Gate receiver for callers that need to select on readiness
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Controller of the live transport, if any
    pub fn controller(&self) -> Option<HandleController> {
        self.controller.read().clone()
    }

    pub fn server(&self) -> Endpoint {
        Endpoint::new(self.target.host.clone(), self.target.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// Record the server's host key in the known-hosts file.
    ///
    /// Only runs the key exchange, accepting an unknown key; a changed key is
    /// still rejected.
    pub async fn grab_pubkey(&self) -> Result<(), SshError> {
        let verifier = self.verifier.with_policy(HostKeyPolicy::Lenient);
        handshake_only(&self.target, &verifier).await?;
        info!("Host key of {} recorded", self.target.label());
        Ok(())
    }

    /// Ask the server to connect to `host:port` and return the channel as a stream
    pub async fn dial(&self, host: &str, port: u16) -> Result<ChannelStream<Msg>, SshError> {
        let controller = self.controller().ok_or(SshError::Disconnected)?;
        let channel = controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(channel.into_stream())
    }

    /// Ask the server to listen on `address:port` (`tcpip-forward`)
    pub async fn listen_remote(&self, address: &str, port: u16) -> Result<RemoteListener, SshError> {
        let controller = self.controller().ok_or(SshError::Disconnected)?;
        let (tx, rx) = mpsc::channel(REMOTE_ACCEPT_BACKLOG);

        let bound = controller.tcpip_forward(address, port as u32).await?;
        let bound_port = if bound == 0 { port as u32 } else { bound };
        self.routes.insert(address, bound_port, tx);
        debug!("Remote listener opened on {}:{}", address, bound_port);

        Ok(RemoteListener {
            address: address.to_string(),
            bound_port,
            rx,
            controller,
            routes: self.routes.clone(),
        })
    }

    /// Make `controller` the live transport and open the gate, unless the
    /// manager was closed in the meantime
    fn publish(&self, controller: &HandleController) -> bool {
        let mut status = self.status.write();
        if self.shutdown.is_cancelled() {
            return false;
        }
        *self.controller.write() = Some(controller.clone());
        *status = ConnectionStatus::Connected;
        self.ready_tx.send_replace(true);
        true
    }

    fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.write();
        if !self.shutdown.is_cancelled() {
            *status = next;
        }
    }

    fn mark_closed(&self) {
        *self.status.write() = ConnectionStatus::Closed;
        self.ready_tx.send_replace(false);
    }

    async fn teardown(&self, controller: HandleController) {
        // status first: a closed gate never sits next to a stale Connected
        self.set_status(ConnectionStatus::Connecting);
        self.ready_tx.send_replace(false);
        self.controller.write().take();
        self.routes.clear();
        controller.disconnect().await;
    }
}

/// A listener on the server side of the transport
pub struct RemoteListener {
    address: String,
    bound_port: u32,
    rx: mpsc::Receiver<ForwardedConnection>,
    controller: HandleController,
    routes: ForwardRoutes,
}

impl RemoteListener {
    /// Next connection accepted by the server; `None` once the transport is gone
    pub async fn accept(&mut self) -> Option<ForwardedConnection> {
        self.rx.recv().await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port actually bound by the server
    pub fn bound_port(&self) -> u32 {
        self.bound_port
    }

    /// Disconnect broadcast of the transport this listener lives on
    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    /// Stop routing connections and cancel the server-side listener
    pub async fn close(self) {
        self.routes.remove(&self.address, self.bound_port);
        if let Err(e) = self
            .controller
            .cancel_tcpip_forward(&self.address, self.bound_port)
            .await
        {
            debug!(
                "cancel-tcpip-forward {}:{} failed: {}",
                self.address, self.bound_port, e
            );
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JumpHostSpec;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client_conf(dir: &std::path::Path, server: String) -> ClientTransportConfig {
        let mut conf = ClientTransportConfig::new(server);
        conf.identity = dir.join("id_missing").to_string_lossy().into_owned();
        conf.password = "secret".into();
        conf.known_hosts = dir.join("known_hosts").to_string_lossy().into_owned();
        conf.reconnect_interval_secs = 1;
        conf
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(ConnectionStatus::Connected.to_string(), "Connected");
        assert_eq!(ConnectionStatus::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_jump_identity_falls_back_to_transport_identity() {
        let temp = tempdir().unwrap();
        let mut conf = client_conf(temp.path(), "user@target:2222".into());
        conf.jump_hosts = vec![
            JumpHostSpec {
                uri: "jumper@bastion".into(),
                identity: String::new(),
                password: String::new(),
            },
            JumpHostSpec {
                uri: "inner:2200".into(),
                identity: "/keys/inner".into(),
                password: "pw".into(),
            },
        ];

        let manager = ConnectionManager::new(&conf).unwrap();
        assert_eq!(manager.jump_hosts.len(), 2);
        assert_eq!(manager.jump_hosts[0].credentials.username, "jumper");
        assert_eq!(manager.jump_hosts[0].port, 22);
        assert_eq!(
            manager.jump_hosts[0].credentials.identity,
            manager.target.credentials.identity
        );
        assert_eq!(
            manager.jump_hosts[1].credentials.identity.as_deref(),
            Some(std::path::Path::new("/keys/inner"))
        );
        assert_eq!(manager.server(), Endpoint::new("target", 2222));
    }

    #[tokio::test]
    async fn test_closed_port_stays_connecting() {
        let temp = tempdir().unwrap();
        let port = closed_port().await;
        let manager = ConnectionManager::new(&client_conf(temp.path(), format!("127.0.0.1:{}", port))).unwrap();

        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert!(!manager.is_ready());
        assert!(tokio::time::timeout(Duration::from_millis(100), manager.ready_wait())
            .await
            .is_err());

        manager.close().await;
        assert_eq!(manager.status(), ConnectionStatus::Closed);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(manager.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_jump_host_never_connects() {
        let temp = tempdir().unwrap();
        let jump_port = closed_port().await;
        let mut conf = client_conf(temp.path(), "127.0.0.1:22".into());
        conf.jump_hosts = vec![
            JumpHostSpec {
                uri: format!("127.0.0.1:{}", jump_port),
                identity: String::new(),
                password: "pw".into(),
            },
            JumpHostSpec {
                uri: "127.0.0.1:22".into(),
                identity: String::new(),
                password: "pw".into(),
            },
        ];
        let manager = ConnectionManager::new(&conf).unwrap();

        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        manager.close().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_fatal() {
        let temp = tempdir().unwrap();
        let mut conf = client_conf(temp.path(), format!("127.0.0.1:{}", closed_port().await));
        conf.password = String::new();
        let manager = ConnectionManager::new(&conf).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), manager.start())
            .await
            .unwrap();
        assert!(matches!(result, Err(SshError::Config(_))));
        assert_eq!(manager.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_dial_without_transport() {
        let temp = tempdir().unwrap();
        let manager = ConnectionManager::new(&client_conf(temp.path(), "127.0.0.1:1".into())).unwrap();
        assert!(matches!(
            manager.dial("127.0.0.1", 80).await,
            Err(SshError::Disconnected)
        ));
        assert!(matches!(
            manager.listen_remote("127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_manager_never_publishes_transport() {
        let temp = tempdir().unwrap();
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let controller = HandleController::from_channel(cmd_tx);

        let open = ConnectionManager::new(&client_conf(temp.path(), "127.0.0.1:1".into())).unwrap();
        assert!(open.publish(&controller));
        assert_eq!(open.status(), ConnectionStatus::Connected);
        assert!(open.is_ready());

        let closed = ConnectionManager::new(&client_conf(temp.path(), "127.0.0.1:1".into())).unwrap();
        closed.close().await;
        assert!(!closed.publish(&controller));
        assert_eq!(closed.status(), ConnectionStatus::Closed);
        assert!(!closed.is_ready());
        assert!(closed.controller().is_none());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let temp = tempdir().unwrap();
        let manager = ConnectionManager::new(&client_conf(temp.path(), "127.0.0.1:1".into())).unwrap();
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.status(), ConnectionStatus::Closed);
        // a closed manager's loop returns immediately
        assert!(manager.start().await.is_ok());
    }
}
