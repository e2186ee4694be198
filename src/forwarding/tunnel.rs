//! Tunnel Engine
//!
//! A tunnel splices a local endpoint and a remote endpoint over a
//! [`ConnectionManager`] transport:
//!
//! - **Forward**: listen locally, ask the server to dial the remote endpoint
//!   (`direct-tcpip`) for every accepted connection.
//! - **Reverse**: ask the server to listen on the remote endpoint
//!   (`tcpip-forward`), dial the local endpoint for every connection it relays
//!   back (`forwarded-tcpip`).
//!
//! `start` loops forever: wait for the transport, open the listener, serve
//! until the listener or the transport fails, sleep, retry. Only `stop`
//! ends it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::bind_listener;
use super::relay::{relay, RelayOptions};
use crate::config::TunnelConfig;
use crate::registry::Registry;
use crate::ssh::{ConnectionManager, Endpoint, ForwardedConnection, SshError};

/// How long `stop` waits for the listener to actually go away
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub type TunnelRegistry = Registry<Arc<Tunnel>>;

/// Which side of the transport listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelDirection {
    /// Local listener, remote destination
    Forward,
    /// Remote listener, local destination
    Reverse,
}

struct Registration {
    id: u64,
    registry: Weak<TunnelRegistry>,
}

pub struct Tunnel {
    local: Endpoint,
    remote: Endpoint,
    direction: TunnelDirection,
    conn: Arc<ConnectionManager>,
    /// The transport belongs to this tunnel alone
    dedicated: bool,
    stoppable: bool,

    registration: Mutex<Option<Registration>>,
    /// Address of the live listener, `None` while not listening
    listening: watch::Sender<Option<String>>,
    /// Relayed connections keyed by peer address
    clients: Mutex<HashMap<String, CancellationToken>>,
    terminate: CancellationToken,
    stopped: AtomicBool,
}

impl Tunnel {
    pub fn new(
        conn: Arc<ConnectionManager>,
        local: Endpoint,
        remote: Endpoint,
        direction: TunnelDirection,
        stoppable: bool,
    ) -> Arc<Self> {
        Self::build(conn, local, remote, direction, stoppable, false)
    }

    /// Build a tunnel from its configuration block.
    ///
    /// A tunnel carrying its own `sshclient` gets a dedicated transport,
    /// started with the tunnel and closed when it stops; otherwise `shared`
    /// is used.
    pub fn from_config(
        conf: &TunnelConfig,
        shared: Option<&Arc<ConnectionManager>>,
        stoppable: bool,
    ) -> Result<Arc<Self>, SshError> {
        let local = Endpoint::parse(&conf.local)?;
        let remote = Endpoint::parse(&conf.remote)?;
        let direction = if conf.forward {
            TunnelDirection::Forward
        } else {
            TunnelDirection::Reverse
        };

        let (conn, dedicated) = match (&conf.sshclient, shared) {
            (Some(client), _) => (ConnectionManager::new(client)?, true),
            (None, Some(shared)) => (shared.clone(), false),
            (None, None) => {
                return Err(SshError::Config(format!(
                    "tunnel {} -> {} has no transport",
                    conf.local, conf.remote
                )))
            }
        };

        Ok(Self::build(conn, local, remote, direction, stoppable, dedicated))
    }

    fn build(
        conn: Arc<ConnectionManager>,
        local: Endpoint,
        remote: Endpoint,
        direction: TunnelDirection,
        stoppable: bool,
        dedicated: bool,
    ) -> Arc<Self> {
        let (listening, _) = watch::channel(None);
        Arc::new(Self {
            local,
            remote,
            direction,
            conn,
            dedicated,
            stoppable,
            registration: Mutex::new(None),
            listening,
            clients: Mutex::new(HashMap::new()),
            terminate: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Add the tunnel to `registry`; `stop` removes it again
    pub fn register(self: &Arc<Self>, registry: &Arc<TunnelRegistry>) -> u64 {
        let id = registry.add(self.clone());
        *self.registration.lock() = Some(Registration {
            id,
            registry: Arc::downgrade(registry),
        });
        id
    }

    /// Run until `stop`.
    ///
    /// Only a dedicated transport ending on a fatal error (bad credentials,
    /// untrusted host key) makes this return an error.
    pub async fn start(self: &Arc<Self>) -> Result<(), SshError> {
        let mut transport = self.dedicated.then(|| {
            let conn = self.conn.clone();
            tokio::spawn(async move { conn.start().await })
        });

        info!("Starting tunnel {}", self);
        let result = loop {
            tokio::select! {
                _ = self.terminate.cancelled() => break Ok(()),
                exit = transport_exit(&mut transport) => match exit {
                    Err(e) => break Err(e),
                    Ok(()) => continue,
                },
                _ = self.conn.ready_wait() => {}
            }

            let served = match self.direction {
                TunnelDirection::Forward => self.serve_forward().await,
                TunnelDirection::Reverse => self.serve_reverse().await,
            };
            if let Err(e) = served {
                warn!("Tunnel {} listener closed: {}", self, e);
            }

            tokio::select! {
                _ = self.terminate.cancelled() => break Ok(()),
                exit = transport_exit(&mut transport) => {
                    if let Err(e) = exit {
                        break Err(e);
                    }
                }
                _ = tokio::time::sleep(self.conn.reconnect_interval()) => {}
            }
        };

        match &result {
            Ok(()) => info!("Tunnel {} terminated", self),
            Err(e) => error!("Tunnel {} gave up, its transport failed: {}", self, e),
        }
        result
    }

    /// Close the listener and every relayed connection. No-op when the tunnel
    /// is not stoppable or already stopped.
    pub async fn stop(&self) {
        if !self.stoppable {
            warn!("Tunnel {} is not stoppable", self);
            return;
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.terminate.cancel();
        self.clients.lock().clear();

        let mut listening = self.listening.subscribe();
        if tokio::time::timeout(STOP_TIMEOUT, listening.wait_for(Option::is_none))
            .await
            .is_err()
        {
            warn!("Tunnel {} listener still open after stop", self);
        }

        if let Some(reg) = self.registration.lock().take() {
            if let Some(registry) = reg.registry.upgrade() {
                let _ = registry.delete(reg.id);
            }
        }

        if self.dedicated {
            self.conn.close().await;
        }
        info!("Tunnel {} stopped", self);
    }

    /// Local listener for forward tunnels, the remote one for reverse tunnels
    pub fn listener_addr(&self) -> Option<String> {
        self.listening.borrow().clone()
    }

    pub fn active_clients_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// The far side of the tunnel: where accepted connections end up
    pub fn endpoint(&self) -> &Endpoint {
        match self.direction {
            TunnelDirection::Forward => &self.remote,
            TunnelDirection::Reverse => &self.local,
        }
    }

    pub fn is_stoppable(&self) -> bool {
        self.stoppable
    }

    pub fn is_listener_local(&self) -> bool {
        self.direction == TunnelDirection::Forward
    }

    pub fn direction(&self) -> TunnelDirection {
        self.direction
    }

    /// Registry id, if registered
    pub fn id(&self) -> Option<u64> {
        self.registration.lock().as_ref().map(|r| r.id)
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    async fn serve_forward(self: &Arc<Self>) -> Result<(), SshError> {
        let controller = self.conn.controller().ok_or(SshError::Disconnected)?;
        let mut disconnect_rx = controller.subscribe_disconnect();

        let listener = bind_listener(&self.local).await?;
        let addr = listener.local_addr()?;
        self.listening.send_replace(Some(addr.to_string()));
        info!("Forward tunnel listening on {} -> {}", addr, self.remote);

        let result = self.accept_local(&listener, &mut disconnect_rx).await;

        drop(listener);
        self.listening.send_replace(None);
        result
    }

    async fn accept_local(
        self: &Arc<Self>,
        listener: &TcpListener,
        disconnect_rx: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), SshError> {
        loop {
            tokio::select! {
                _ = self.terminate.cancelled() => return Ok(()),
                _ = disconnect_rx.recv() => return Err(SshError::Disconnected),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    self.spawn_forward_client(stream, peer);
                }
            }
        }
    }

    fn spawn_forward_client(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            debug!("Tunnel {} accepted {}", tunnel, peer);
            match tunnel.conn.dial(&tunnel.remote.host, tunnel.remote.port).await {
                Ok(channel) => tunnel.track_relay(peer.to_string(), stream, channel),
                Err(e) => warn!("Tunnel {} cannot reach {}: {}", tunnel, tunnel.remote, e),
            }
        });
    }

    async fn serve_reverse(self: &Arc<Self>) -> Result<(), SshError> {
        let mut listener = self
            .conn
            .listen_remote(&self.remote.host, self.remote.port)
            .await?;
        let addr = format!("{}:{}", self.remote.host, listener.bound_port());
        self.listening.send_replace(Some(addr.clone()));
        info!("Reverse tunnel listening on remote {} -> {}", addr, self.local);

        let mut disconnect_rx = listener.controller().subscribe_disconnect();
        let result = loop {
            tokio::select! {
                _ = self.terminate.cancelled() => break Ok(()),
                _ = disconnect_rx.recv() => break Err(SshError::Disconnected),
                accepted = listener.accept() => match accepted {
                    Some(forwarded) => self.spawn_reverse_client(forwarded),
                    None => break Err(SshError::Disconnected),
                },
            }
        };

        listener.close().await;
        self.listening.send_replace(None);
        result
    }

    fn spawn_reverse_client(self: &Arc<Self>, forwarded: ForwardedConnection) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            let peer = format!(
                "{}:{}",
                forwarded.originator_address, forwarded.originator_port
            );
            debug!("Tunnel {} accepted {} on the remote side", tunnel, peer);

            match TcpStream::connect((tunnel.local.host.as_str(), tunnel.local.port)).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    tunnel.track_relay(peer, forwarded.channel.into_stream(), stream);
                }
                Err(e) => {
                    warn!("Tunnel {} cannot reach {}: {}", tunnel, tunnel.local, e);
                    let _ = forwarded.channel.close().await;
                }
            }
        });
    }

    /// Relay `a` and `b`, tracking the pair under `peer` until it closes
    fn track_relay<A, B>(self: &Arc<Self>, peer: String, a: A, b: B)
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let token = self.terminate.child_token();
        {
            let mut clients = self.clients.lock();
            if self.terminate.is_cancelled() {
                return;
            }
            clients.insert(peer.clone(), token.clone());
        }

        let tunnel = Arc::downgrade(self);
        let options = RelayOptions::new().cancel_token(token).on_close(move || {
            if let Some(tunnel) = tunnel.upgrade() {
                tunnel.clients.lock().remove(&peer);
                debug!("Tunnel {} closed connection from {}", tunnel, peer);
            }
        });
        relay(a, b, options);
    }
}

/// Outcome of the dedicated transport's reconnect loop; pending forever when
/// there is none or it already ended
async fn transport_exit(task: &mut Option<JoinHandle<Result<(), SshError>>>) -> Result<(), SshError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(SshError::ConnectionFailed(format!(
            "transport task failed: {}",
            e
        ))),
    };
    *task = None;
    result
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            TunnelDirection::Forward => write!(f, "{} -> {}", self.local, self.remote),
            TunnelDirection::Reverse => write!(f, "{} <- {}", self.local, self.remote),
        }
    }
}
