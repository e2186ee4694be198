//! Forwarding Server
//!
//! An SSH server exposing only what tunnels need: remote listeners
//! (`tcpip-forward`), dials on the client's behalf (`direct-tcpip`), and
//! keep-alive probing of connected clients.
//!
//! Liveness: russh sends `keepalive@openssh.com` every liveness interval and
//! ends the session once a keep-alive goes unanswered for another interval. The
//! connection's alive flag then drops and every remote listener of that
//! connection closes right away.

mod forward;
mod handler;
mod keys;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use forward::ForwardTable;
pub use handler::{AuthPolicy, ServerHandler};
pub use keys::{load_or_generate_host_key, parse_authorized_keys, AuthorizedKeys};

use crate::config::{expand_tilde, ServerConfig};
use crate::forwarding::bind_listener;
use crate::registry::Registry;
use crate::ssh::{Endpoint, SshError};

/// Unanswered keep-alives tolerated before a client is considered gone.
/// russh treats 0 as "never give up".
const KEEPALIVE_MAX: usize = 1;

pub struct ForwardingServer {
    listen: Endpoint,
    russh_config: Arc<russh::server::Config>,
    auth: Arc<AuthPolicy>,
    disable_shell: bool,
    liveness_interval: Duration,

    listening: watch::Sender<Option<SocketAddr>>,
    /// Remote listener tables of the live SSH connections
    connections: Arc<Registry<Arc<ForwardTable>>>,
    shutdown: CancellationToken,
}

impl ForwardingServer {
    /// Load keys and prepare the server. Fails on an empty listen address or
    /// when no authentication method is usable.
    pub async fn new(conf: &ServerConfig) -> Result<Self, SshError> {
        let listen = parse_listen_address(&conf.listen_address)?;

        let host_key = load_or_generate_host_key(&expand_tilde(&conf.server_key)).await?;
        let keys = if conf.disable_auth {
            AuthorizedKeys::default()
        } else {
            AuthorizedKeys::load(&conf.authorized_keys).await
        };
        let auth = AuthPolicy::new(
            keys,
            Some(conf.authorized_password.clone()),
            conf.disable_auth,
        );
        if !auth.is_usable() {
            return Err(SshError::Config(
                "no authorized key could be loaded and no password is set".into(),
            ));
        }
        if conf.disable_auth {
            warn!("Authentication is disabled: every client is accepted");
        }

        let liveness_interval = conf.liveness_interval();
        let russh_config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: None,
            keepalive_interval: Some(liveness_interval),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let (listening, _) = watch::channel(None);
        Ok(Self {
            listen,
            russh_config,
            auth: Arc::new(auth),
            disable_shell: conf.disable_shell,
            liveness_interval,
            listening,
            connections: Arc::new(Registry::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the listen address and serve until `stop`
    pub async fn start(&self) -> Result<(), SshError> {
        let listener = bind_listener(&self.listen).await?;
        self.serve(listener).await
    }

    /// Serve SSH connections accepted on `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SshError> {
        let addr = listener.local_addr()?;
        self.listening.send_replace(Some(addr));
        info!("SSH server listening on {}", addr);

        let result = loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => break Err(SshError::from(e)),
                },
            };
            debug!("Accepted SSH connection from {}", peer);
            tokio::spawn(self.connection_task(stream, peer));
        };

        drop(listener);
        self.listening.send_replace(None);
        if let Err(e) = &result {
            error!("SSH server on {} stopped: {}", addr, e);
        }
        result
    }

    /// Stop accepting connections and close every remote listener
    pub fn stop(&self) {
        self.shutdown.cancel();
        for (_, forwards) in self.connections.get_all() {
            forwards.cancel_all();
        }
    }

    /// Address of the SSH listener while serving
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        *self.listening.borrow()
    }

    /// Bind addresses of every live remote listener
    pub fn active_forwards(&self) -> Vec<String> {
        self.connections
            .get_all()
            .into_iter()
            .flat_map(|(_, forwards)| forwards.bind_addresses())
            .collect()
    }

    fn connection_task(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let config = self.russh_config.clone();
        let connections = self.connections.clone();
        let forwards = Arc::new(ForwardTable::new());
        let (alive_tx, alive_rx) = watch::channel(true);
        let handler = ServerHandler::new(
            Some(peer),
            self.auth.clone(),
            self.disable_shell,
            forwards.clone(),
            alive_rx,
            self.liveness_interval,
        );

        async move {
            let id = connections.add(forwards.clone());
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session with {} ended: {}", peer, e);
                    }
                }
                Err(e) => warn!("SSH handshake with {} failed: {}", peer, e),
            }

            alive_tx.send_replace(false);
            forwards.cancel_all();
            let _ = connections.delete(id);
            info!("SSH connection from {} closed", peer);
        }
    }
}

/// `":2222"` listens on every interface
fn parse_listen_address(s: &str) -> Result<Endpoint, SshError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SshError::Config("sshd listen address is empty".into()));
    }
    match s.strip_prefix(':') {
        Some(port) => {
            let port = port
                .parse()
                .map_err(|_| SshError::Config(format!("invalid listen address: {}", s)))?;
            Ok(Endpoint::new("0.0.0.0", port))
        }
        None => Endpoint::parse(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientTransportConfig, JumpHostSpec};
    use crate::forwarding::{Tunnel, TunnelDirection, TunnelRegistry};
    use crate::ssh::{ConnectionManager, ConnectionStatus};
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};
    use russh::keys::PrivateKey;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Notify;

    struct Fixture {
        temp: TempDir,
        server: Arc<ForwardingServer>,
        addr: SocketAddr,
        identity: PathBuf,
    }

    impl Fixture {
        async fn start() -> Self {
            let temp = tempfile::tempdir().unwrap();

            let client_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
            let identity = temp.path().join("id_ed25519");
            std::fs::write(&identity, client_key.to_openssh(LineEnding::LF).unwrap().as_bytes())
                .unwrap();
            let authorized = temp.path().join("authorized_keys");
            std::fs::write(
                &authorized,
                format!("{}\n", client_key.public_key().to_openssh().unwrap()),
            )
            .unwrap();

            let mut conf = ServerConfig::new("127.0.0.1:0");
            conf.server_key = temp.path().join("server_key").to_string_lossy().into_owned();
            conf.authorized_keys = vec![authorized.to_string_lossy().into_owned()];
            conf.liveness_interval_secs = 1;

            let server = Arc::new(ForwardingServer::new(&conf).await.unwrap());
            let runner = server.clone();
            tokio::spawn(async move { runner.start().await });

            let addr = wait_for(|| server.listener_addr()).await;
            Self {
                temp,
                server,
                addr,
                identity,
            }
        }

        fn client_conf(&self, port: u16) -> ClientTransportConfig {
            let mut conf = ClientTransportConfig::new(format!("tester@127.0.0.1:{}", port));
            conf.identity = self.identity.to_string_lossy().into_owned();
            conf.known_hosts = self
                .temp
                .path()
                .join("known_hosts")
                .to_string_lossy()
                .into_owned();
            conf.reconnect_interval_secs = 1;
            conf.keepalive_interval_secs = 1;
            conf
        }

        /// Connected manager talking to the server directly
        async fn connect(&self) -> Arc<ConnectionManager> {
            let mut conf = self.client_conf(self.addr.port());
            conf.insecure = true;
            start_manager(&conf).await
        }
    }

    async fn start_manager(conf: &ClientTransportConfig) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(conf).unwrap();
        let runner = manager.clone();
        tokio::spawn(async move { runner.start().await });
        tokio::time::timeout(Duration::from_secs(10), manager.ready_wait())
            .await
            .expect("transport never became ready");
        manager
    }

    async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
        for _ in 0..250 {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        panic!("condition not reached in time");
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn assert_echo(addr: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"test\n").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"test");
        stream
    }

    /// TCP proxy that can stop moving bytes while keeping both sockets open
    async fn freezable_proxy(target: SocketAddr) -> (u16, Arc<Notify>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let freeze = Arc::new(Notify::new());
        let freeze_rx = freeze.clone();
        tokio::spawn(async move {
            let Ok((mut inbound, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut outbound) = TcpStream::connect(target).await else {
                return;
            };
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                _ = freeze_rx.notified() => std::future::pending::<()>().await,
            }
        });
        (port, freeze)
    }

    /// TCP proxy whose live connections can all be dropped at once; later
    /// connections go through normally
    async fn cuttable_proxy(target: SocketAddr) -> (u16, watch::Sender<u64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cut_tx, _) = watch::channel(0u64);
        let cut = cut_tx.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let mut cut_rx = cut.subscribe();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(target).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = cut_rx.changed() => {}
                    }
                });
            }
        });
        (port, cut_tx)
    }

    #[tokio::test]
    async fn test_listen_address_parsing() {
        assert_eq!(
            parse_listen_address(":2222").unwrap(),
            Endpoint::new("0.0.0.0", 2222)
        );
        assert_eq!(
            parse_listen_address("127.0.0.1:2200").unwrap(),
            Endpoint::new("127.0.0.1", 2200)
        );
        assert!(matches!(parse_listen_address(""), Err(SshError::Config(_))));
        assert!(matches!(parse_listen_address(":x"), Err(SshError::Config(_))));
    }

    #[tokio::test]
    async fn test_no_usable_auth_is_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let mut conf = ServerConfig::new("127.0.0.1:0");
        conf.server_key = temp.path().join("server_key").to_string_lossy().into_owned();
        conf.authorized_keys = vec![temp.path().join("none").to_string_lossy().into_owned()];
        assert!(matches!(
            ForwardingServer::new(&conf).await,
            Err(SshError::Config(_))
        ));

        conf.disable_auth = true;
        assert!(ForwardingServer::new(&conf).await.is_ok());
    }

    #[tokio::test]
    async fn test_strict_unknown_host_then_grab() {
        let fixture = Fixture::start().await;
        let conf = fixture.client_conf(fixture.addr.port());

        let manager = ConnectionManager::new(&conf).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), manager.start())
            .await
            .unwrap();
        assert!(matches!(result, Err(SshError::HostKeyUnknown { .. })));
        assert_eq!(manager.status(), ConnectionStatus::Closed);

        manager.grab_pubkey().await.unwrap();

        let manager = start_manager(&conf).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert!(manager.is_ready());

        manager.close().await;
        assert_eq!(manager.status(), ConnectionStatus::Closed);
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_forward_tunnel_round_trip() {
        let fixture = Fixture::start().await;
        let echo_port = echo_server().await;
        let manager = fixture.connect().await;
        let registry = Arc::new(TunnelRegistry::new());

        let tunnel = Tunnel::new(
            manager.clone(),
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", echo_port),
            TunnelDirection::Forward,
            true,
        );
        tunnel.register(&registry);
        let runner = tunnel.clone();
        tokio::spawn(async move { runner.start().await });

        let addr = wait_for(|| tunnel.listener_addr()).await;
        let _client = assert_echo(&addr).await;
        assert_eq!(tunnel.active_clients_count(), 1);
        assert_eq!(registry.len(), 1);

        tunnel.stop().await;
        assert_eq!(tunnel.active_clients_count(), 0);
        assert!(registry.is_empty());
        assert!(TcpStream::connect(&addr).await.is_err());

        tunnel.stop().await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_forward_tunnel_through_jump_host() {
        let jump = Fixture::start().await;
        let target = Fixture::start().await;
        let echo_port = echo_server().await;

        let mut conf = target.client_conf(target.addr.port());
        conf.insecure = true;
        conf.jump_hosts = vec![JumpHostSpec {
            uri: format!("tester@127.0.0.1:{}", jump.addr.port()),
            identity: jump.identity.to_string_lossy().into_owned(),
            password: String::new(),
        }];
        let manager = start_manager(&conf).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(manager.server(), Endpoint::new("127.0.0.1", target.addr.port()));

        let tunnel = Tunnel::new(
            manager.clone(),
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", echo_port),
            TunnelDirection::Forward,
            true,
        );
        let runner = tunnel.clone();
        tokio::spawn(async move { runner.start().await });

        let addr = wait_for(|| tunnel.listener_addr()).await;
        let _client = assert_echo(&addr).await;
        assert_eq!(tunnel.active_clients_count(), 1);

        tunnel.stop().await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_rearms_gate_and_restores_tunnel() {
        let fixture = Fixture::start().await;
        let echo_port = echo_server().await;
        let (proxy_port, cut) = cuttable_proxy(fixture.addr).await;

        let mut conf = fixture.client_conf(proxy_port);
        conf.insecure = true;
        let manager = start_manager(&conf).await;
        let mut ready = manager.ready_watch();

        let tunnel = Tunnel::new(
            manager.clone(),
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", echo_port),
            TunnelDirection::Forward,
            true,
        );
        let runner = tunnel.clone();
        tokio::spawn(async move { runner.start().await });
        let addr = wait_for(|| tunnel.listener_addr()).await;
        drop(assert_echo(&addr).await);

        cut.send_modify(|generation| *generation += 1);

        tokio::time::timeout(Duration::from_secs(10), ready.wait_for(|ready| !*ready))
            .await
            .expect("gate was not re-armed")
            .unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        wait_for(|| tunnel.listener_addr().is_none().then_some(())).await;

        tokio::time::timeout(Duration::from_secs(10), ready.wait_for(|ready| *ready))
            .await
            .expect("transport never came back")
            .unwrap();
        assert_eq!(manager.status(), ConnectionStatus::Connected);

        let addr = wait_for(|| tunnel.listener_addr()).await;
        let _client = assert_echo(&addr).await;

        tunnel.stop().await;
        manager.close().await;
    }

    #[tokio::test]
    async fn test_keepalive_detects_frozen_transport() {
        let fixture = Fixture::start().await;
        let (proxy_port, freeze) = freezable_proxy(fixture.addr).await;

        let mut conf = fixture.client_conf(proxy_port);
        conf.insecure = true;
        let manager = start_manager(&conf).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);

        freeze.notify_one();

        // one keep-alive interval plus the ping timeout, with slack
        tokio::time::timeout(Duration::from_secs(15), async {
            while manager.status() == ConnectionStatus::Connected || manager.is_ready() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("stalled transport still reported Connected");
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert!(!manager.is_ready());

        manager.close().await;
        assert_eq!(manager.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_reverse_tunnel_round_trip() {
        let fixture = Fixture::start().await;
        let echo_port = echo_server().await;
        let manager = fixture.connect().await;

        let tunnel = Tunnel::new(
            manager.clone(),
            Endpoint::new("127.0.0.1", echo_port),
            Endpoint::new("127.0.0.1", 0),
            TunnelDirection::Reverse,
            true,
        );
        let runner = tunnel.clone();
        tokio::spawn(async move { runner.start().await });

        let addr = wait_for(|| tunnel.listener_addr()).await;
        assert_eq!(fixture.server.active_forwards().len(), 1);
        let _client = assert_echo(&addr).await;
        assert_eq!(tunnel.active_clients_count(), 1);

        tunnel.stop().await;
        assert_eq!(tunnel.active_clients_count(), 0);
        wait_for(|| fixture.server.active_forwards().is_empty().then_some(())).await;
        assert!(TcpStream::connect(&addr).await.is_err());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_tcpip_forward_port_zero_reply() {
        let fixture = Fixture::start().await;
        let manager = fixture.connect().await;

        let listener = manager.listen_remote("127.0.0.1", 0).await.unwrap();
        let port = listener.bound_port();
        assert_ne!(port, 0);
        assert_eq!(
            fixture.server.active_forwards(),
            vec![format!("127.0.0.1:{}", port)]
        );

        // connect to the advertised port on our own
        assert!(TcpStream::connect(("127.0.0.1", port as u16)).await.is_ok());

        listener.close().await;
        wait_for(|| fixture.server.active_forwards().is_empty().then_some(())).await;
        assert!(TcpStream::connect(("127.0.0.1", port as u16)).await.is_err());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_liveness_closes_forward_of_vanished_client() {
        let fixture = Fixture::start().await;
        let (proxy_port, freeze) = freezable_proxy(fixture.addr).await;

        let mut conf = fixture.client_conf(proxy_port);
        conf.insecure = true;
        conf.keepalive_interval_secs = 60;
        conf.reconnect_interval_secs = 60;
        let manager = start_manager(&conf).await;

        let listener = manager.listen_remote("127.0.0.1", 0).await.unwrap();
        let port = listener.bound_port() as u16;
        assert_eq!(fixture.server.active_forwards().len(), 1);

        freeze.notify_one();

        // two liveness intervals for russh to give up, plus slack
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            while !fixture.server.active_forwards().is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("forward survived its client");
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        drop(listener);
        manager.close().await;
    }
}
